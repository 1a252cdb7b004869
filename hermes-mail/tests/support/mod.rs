#![allow(dead_code)]

pub mod mock_server;

use hermes_mail::{ComposedMail, SmtpConfig, SmtpTransport, TlsMode};

pub fn plain_transport(addr: std::net::SocketAddr) -> SmtpTransport {
    let mut config = SmtpConfig::new(addr.ip().to_string());
    config.port = addr.port();
    config.tls = TlsMode::None;
    config.helo = "client.test".to_string();

    SmtpTransport::new(config).expect("valid relay configuration")
}

pub fn mail(recipients: &[&str]) -> ComposedMail {
    ComposedMail {
        message_id: "<01TEST@example.com>".to_string(),
        sender: "sender@example.com".to_string(),
        recipients: recipients.iter().map(ToString::to_string).collect(),
        data: "Subject: Test\r\n\r\nHello\r\n.hidden dot\r\n".to_string(),
    }
}
