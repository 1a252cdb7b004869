//! Process configuration
//!
//! Loaded from a RON file, then overlaid with `HERMES_SMTP_*` environment
//! variables so credentials never have to live in the file.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use hermes_common::{ConfigError, audit::AuditConfig};
use hermes_mail::{DirectoryStore, MemoryStore, ObjectStore, SmtpConfig, request::envelope_address};
use hermes_redrive::RetryPolicy;
use serde::Deserialize;

pub const CONFIG_ENV: &str = "HERMES_CONFIG";

const DEFAULT_PATHS: [&str; 2] = ["./hermes.config.ron", "/etc/hermes/hermes.config.ron"];

/// Where templates or attachments are read from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub enum StoreConfig {
    /// A bucket laid out as a directory below `root`
    Directory {
        root: PathBuf,
        bucket: String,
        #[serde(default)]
        read_timeout_secs: Option<u64>,
    },
    /// An empty in-process store
    #[default]
    Memory,
}

impl StoreConfig {
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the bucket name or timeout is unusable.
    pub fn build(&self, field: &str) -> Result<Arc<dyn ObjectStore>, ConfigError> {
        match self {
            Self::Memory => Ok(Arc::new(MemoryStore::new(field.to_string()))),
            Self::Directory {
                root,
                bucket,
                read_timeout_secs,
            } => {
                let mut store = DirectoryStore::new(root, bucket)
                    .map_err(|e| ConfigError::invalid(format!("{field}.bucket"), e.to_string()))?;

                match read_timeout_secs {
                    Some(0) => {
                        return Err(ConfigError::invalid(
                            format!("{field}.read_timeout_secs"),
                            "must be greater than 0",
                        ));
                    }
                    Some(secs) => store = store.with_read_timeout(Duration::from_secs(*secs)),
                    None => {}
                }

                Ok(Arc::new(store))
            }
        }
    }
}

/// The queue this process consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct QueueConfig {
    /// Queue name or URL, used for logging only
    #[serde(default)]
    pub identifier: Option<String>,

    /// Directory for records that exhausted their retries. Only a dry run
    /// may leave it out, quarantined records are then kept in memory.
    #[serde(default)]
    pub quarantine: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub template_store: StoreConfig,

    #[serde(default)]
    pub attachment_store: StoreConfig,

    #[serde(default = "defaults::smtp")]
    pub smtp: SmtpConfig,

    /// Deployment region, reported in logs
    #[serde(default)]
    pub region: Option<String>,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Records processed at the same time
    #[serde(default = "defaults::concurrency")]
    pub concurrency: usize,

    /// Sender for requests that do not name one
    #[serde(default)]
    pub default_from: Option<String>,

    #[serde(default)]
    pub audit: AuditConfig,

    /// Compose mails without contacting the relay
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            template_store: StoreConfig::default(),
            attachment_store: StoreConfig::default(),
            smtp: defaults::smtp(),
            region: None,
            queue: QueueConfig::default(),
            retry: RetryPolicy::default(),
            concurrency: defaults::concurrency(),
            default_from: None,
            audit: AuditConfig::default(),
            dry_run: false,
        }
    }
}

mod defaults {
    use hermes_mail::SmtpConfig;

    pub fn smtp() -> SmtpConfig {
        SmtpConfig::new("")
    }

    pub const fn concurrency() -> usize {
        1
    }
}

impl Config {
    /// Locate, load and overlay the configuration with the process
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if no file is found or it cannot be used.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = find_config_file(explicit)?;
        let mut config = Self::load(&path)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        Self::parse(&content)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if `content` is not a valid configuration.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        ron::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Overlay SMTP settings from `HERMES_SMTP_USER`, `HERMES_SMTP_PASS`,
    /// `HERMES_SMTP_HOST` and `HERMES_SMTP_PORT`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the port is not a number.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(user) = lookup("HERMES_SMTP_USER") {
            self.smtp.username = Some(user);
        }

        if let Some(pass) = lookup("HERMES_SMTP_PASS") {
            self.smtp.password = Some(pass);
        }

        if let Some(host) = lookup("HERMES_SMTP_HOST") {
            self.smtp.host = host;
        }

        if let Some(port) = lookup("HERMES_SMTP_PORT") {
            self.smtp.port = port.trim().parse().map_err(|_| {
                ConfigError::invalid("HERMES_SMTP_PORT", format!("'{port}' is not a port"))
            })?;
        }

        Ok(())
    }

    /// Check everything that can be checked before the first record.
    ///
    /// The relay settings and real stores are not required for a dry run.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;

        if self.concurrency == 0 {
            return Err(ConfigError::invalid("concurrency", "must be at least 1"));
        }

        if !self.dry_run {
            self.smtp.validate()?;
        }

        if let Some(from) = &self.default_from
            && envelope_address(from).is_none()
        {
            return Err(ConfigError::invalid(
                "default_from",
                format!("'{from}' is not a valid address"),
            ));
        }

        if !self.dry_run {
            self.validate_required()?;
        }

        self.template_store.build("template_store")?;
        self.attachment_store.build("attachment_store")?;

        Ok(())
    }
}

impl Config {
    /// Options a real run cannot do without.
    fn validate_required(&self) -> Result<(), ConfigError> {
        if self.template_store == StoreConfig::Memory {
            return Err(ConfigError::Missing("template_store"));
        }
        if self.attachment_store == StoreConfig::Memory {
            return Err(ConfigError::Missing("attachment_store"));
        }
        if self.region.as_deref().is_none_or(|region| region.trim().is_empty()) {
            return Err(ConfigError::Missing("region"));
        }

        let queue = &self.queue;
        if queue.identifier.as_deref().is_none_or(|id| id.trim().is_empty()) {
            return Err(ConfigError::Missing("queue.identifier"));
        }
        if queue.quarantine.is_none() {
            return Err(ConfigError::Missing("queue.quarantine"));
        }

        Ok(())
    }
}

/// Find the configuration file using the following precedence:
/// 1. `explicit`, usually from the command line
/// 2. `HERMES_CONFIG` environment variable
/// 3. ./hermes.config.ron (current working directory)
/// 4. /etc/hermes/hermes.config.ron (system-wide config)
///
/// # Errors
///
/// Returns [`ConfigError::NotFound`] if none of them exists.
pub fn find_config_file(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
    let defaults = DEFAULT_PATHS.map(PathBuf::from);

    locate(explicit, from_env.as_deref(), &defaults)
}

fn locate(
    explicit: Option<&Path>,
    from_env: Option<&Path>,
    defaults: &[PathBuf],
) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return existing(path, "--config");
    }

    if let Some(path) = from_env {
        return existing(path, CONFIG_ENV);
    }

    if let Some(path) = defaults.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = defaults
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    Err(ConfigError::NotFound(format!(
        "  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )))
}

fn existing(path: &Path, source: &str) -> Result<PathBuf, ConfigError> {
    if path.exists() {
        Ok(path.to_path_buf())
    } else {
        Err(ConfigError::NotFound(format!(
            "  - {} (from {source})",
            path.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use hermes_mail::TlsMode;

    use super::*;

    const FULL: &str = r#"(
        template_store: Directory(root: "/srv/mail", bucket: "templates"),
        attachment_store: Directory(root: "/srv/mail", bucket: "attachments", read_timeout_secs: Some(5)),
        smtp: (host: "smtp.example.com", port: 587, tls: StartTls),
        region: Some("eu-west-3"),
        queue: (identifier: Some("mail-queue"), quarantine: Some("/var/lib/hermes/dead-letter")),
        retry: (max_attempts: 5, base_delay_ms: 100),
        concurrency: 4,
        default_from: Some("noreply@example.com"),
    )"#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(FULL).unwrap();

        assert_eq!(
            config.template_store,
            StoreConfig::Directory {
                root: PathBuf::from("/srv/mail"),
                bucket: "templates".to_string(),
                read_timeout_secs: None,
            }
        );
        assert_eq!(config.smtp.host, "smtp.example.com");
        assert_eq!(config.smtp.port, 587);
        assert_eq!(config.smtp.tls, TlsMode::StartTls);
        assert_eq!(config.region.as_deref(), Some("eu-west-3"));
        assert_eq!(config.queue.identifier.as_deref(), Some("mail-queue"));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.concurrency, 4);
        assert!(config.audit.enabled);
        assert!(!config.dry_run);

        config.validate().unwrap();
    }

    #[test]
    fn test_sample_config_is_valid() {
        let config = Config::parse(include_str!("../../hermes.config.ron")).unwrap();
        assert_eq!(config.smtp.helo, "mailer.example.com");
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse("()").unwrap();

        assert_eq!(config.template_store, StoreConfig::Memory);
        assert_eq!(config.smtp.port, 465);
        assert_eq!(config.smtp.tls, TlsMode::Implicit);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.concurrency, 1);
        assert!(config.queue.quarantine.is_none());

        // Nothing names a relay
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("smtp.host"))
        ));
    }

    #[test]
    fn test_stores_are_required() {
        let config =
            Config::parse("(smtp: (host: \"smtp.example.com\"), template_store: Memory)").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("template_store"))
        ));
    }

    const WITHOUT_QUEUE: &str = r#"(
        smtp: (host: "smtp.example.com"),
        template_store: Directory(root: "/srv/mail", bucket: "templates"),
        attachment_store: Directory(root: "/srv/mail", bucket: "attachments"),
    )"#;

    #[test]
    fn test_queue_and_region_are_required() {
        let mut config = Config::parse(WITHOUT_QUEUE).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Missing("region"))));

        config.region = Some("eu-west-3".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("queue.identifier"))
        ));

        config.queue.identifier = Some("mail-queue".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("queue.quarantine"))
        ));

        config.queue.quarantine = Some(PathBuf::from("/var/lib/hermes/dead-letter"));
        config.validate().unwrap();
    }

    #[test]
    fn test_blank_region_is_missing() {
        let mut config = Config::parse(WITHOUT_QUEUE).unwrap();
        config.region = Some("  ".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::Missing("region"))));
    }

    #[test]
    fn test_dry_run_does_not_need_a_queue() {
        let mut config = Config::parse(WITHOUT_QUEUE).unwrap();
        config.dry_run = true;
        config.validate().unwrap();
    }

    #[test]
    fn test_dry_run_does_not_need_a_relay() {
        let config = Config::parse("(dry_run: true)").unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_error() {
        let err = Config::parse("(concurrency: \"many\")").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("HERMES_SMTP_USER", "mailer"),
            ("HERMES_SMTP_PASS", "s3cret"),
            ("HERMES_SMTP_HOST", "relay.internal"),
            ("HERMES_SMTP_PORT", "2525"),
        ]);

        let mut config = Config::parse("(smtp: (host: \"ignored\"))").unwrap();
        config
            .apply_env(|name| env.get(name).map(ToString::to_string))
            .unwrap();

        assert_eq!(config.smtp.host, "relay.internal");
        assert_eq!(config.smtp.port, 2525);
        assert_eq!(config.smtp.username.as_deref(), Some("mailer"));
        assert_eq!(config.smtp.password.as_deref(), Some("s3cret"));
        config.smtp.validate().unwrap();
    }

    #[test]
    fn test_invalid_port_from_environment() {
        let mut config = Config::default();
        let err = config
            .apply_env(|name| (name == "HERMES_SMTP_PORT").then(|| "smtp".to_string()))
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Invalid value for HERMES_SMTP_PORT: 'smtp' is not a port"
        );
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config::default();
        config.dry_run = true;

        config.concurrency = 0;
        assert!(config.validate().is_err());
        config.concurrency = 2;

        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
        config.retry.max_attempts = 3;

        config.default_from = Some("not an address".to_string());
        assert!(config.validate().is_err());
        config.default_from = None;

        config.template_store = StoreConfig::Directory {
            root: PathBuf::from("/srv"),
            bucket: "../etc".to_string(),
            read_timeout_secs: None,
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().starts_with("Invalid value for template_store.bucket"));

        config.template_store = StoreConfig::Directory {
            root: PathBuf::from("/srv"),
            bucket: "templates".to_string(),
            read_timeout_secs: Some(0),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_locate_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("explicit.ron");
        let env = dir.path().join("env.ron");
        let fallback = dir.path().join("hermes.config.ron");
        for path in [&explicit, &env, &fallback] {
            std::fs::write(path, "()").unwrap();
        }
        let defaults = [dir.path().join("missing.ron"), fallback.clone()];

        assert_eq!(
            locate(Some(&explicit), Some(&env), &defaults).unwrap(),
            explicit
        );
        assert_eq!(locate(None, Some(&env), &defaults).unwrap(), env);
        assert_eq!(locate(None, None, &defaults).unwrap(), fallback);

        let err = locate(None, Some(&dir.path().join("gone.ron")), &defaults).unwrap_err();
        assert!(err.to_string().contains("gone.ron (from HERMES_CONFIG)"));

        let err = locate(None, None, &defaults[..1]).unwrap_err();
        assert!(err.to_string().contains("missing.ron"));
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hermes.config.ron");
        std::fs::write(&path, "(concurrency: 8, dry_run: true)").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.concurrency, 8);

        let err = Config::load(&dir.path().join("nope.ron")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
