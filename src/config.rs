//! Configuration loader and validator for the digest engine.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub mail: Mail,
    pub shortlink: ShortLink,
    pub digest: Digest,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Local-time offset from UTC, in minutes. Delivery hours and the
    /// once-per-day gate are evaluated in this offset.
    pub utc_offset_minutes: i32,
    /// Wall-clock budget for a single pipeline run.
    pub run_timeout_seconds: u64,
    /// Parallel in-flight short-link mint calls per run.
    pub mint_concurrency: usize,
    /// Public site root used for long-form listing links.
    pub site_base_url: String,
}

/// Outbound mail provider (Postmark-compatible JSON API).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mail {
    pub api_url: String,
    pub server_token: String,
    pub from: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub subject_prefix: Option<String>,
}

/// Short-link minting service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShortLink {
    pub api_url: String,
    pub source_tag: String,
    /// When false, every link falls back to its long form.
    pub enabled: bool,
}

/// Global digest text defaults; templates opt in or override.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Digest {
    pub default_header: String,
    pub default_footer: String,
    pub empty_notice: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.run_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("app.run_timeout_seconds must be > 0"));
    }
    if cfg.app.mint_concurrency == 0 {
        return Err(ConfigError::Invalid("app.mint_concurrency must be > 0"));
    }
    if cfg.app.utc_offset_minutes.abs() > 14 * 60 {
        return Err(ConfigError::Invalid(
            "app.utc_offset_minutes must be within +/- 14 hours",
        ));
    }
    if cfg.app.site_base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("app.site_base_url must be non-empty"));
    }

    if cfg.mail.api_url.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.api_url must be non-empty"));
    }
    if cfg.mail.server_token.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.server_token must be non-empty"));
    }
    if cfg.mail.from.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.from must be non-empty"));
    }

    if cfg.shortlink.enabled && cfg.shortlink.api_url.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "shortlink.api_url must be non-empty when shortlink.enabled",
        ));
    }
    if cfg.shortlink.enabled && cfg.shortlink.source_tag.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "shortlink.source_tag must be non-empty when shortlink.enabled",
        ));
    }

    if cfg.digest.default_header.trim().is_empty() {
        return Err(ConfigError::Invalid("digest.default_header must be non-empty"));
    }
    if cfg.digest.default_footer.trim().is_empty() {
        return Err(ConfigError::Invalid("digest.default_footer must be non-empty"));
    }
    if cfg.digest.empty_notice.trim().is_empty() {
        return Err(ConfigError::Invalid("digest.empty_notice must be non-empty"));
    }

    Ok(())
}

/// Example YAML document; doubles as the config fixture in tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  utc_offset_minutes: -300
  run_timeout_seconds: 120
  mint_concurrency: 4
  site_base_url: "https://rentals.example.com"

mail:
  api_url: "https://api.postmarkapp.com/email"
  server_token: "YOUR_POSTMARK_SERVER_TOKEN"
  from: "digest@rentals.example.com"
  reply_to: "team@rentals.example.com"
  subject_prefix: "[Rentals]"

shortlink:
  api_url: "https://go.rentals.example.com/api/links"
  source_tag: "digest"
  enabled: true

digest:
  default_header: "New rental listings for {date}"
  default_footer: "You receive this digest as a site admin."
  empty_notice: "Nothing new today."
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
    }

    #[test]
    fn invalid_mail_token() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.mail.server_token = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("mail.server_token")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_timezone_offset() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.utc_offset_minutes = 15 * 60;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("utc_offset_minutes")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn shortlink_url_only_required_when_enabled() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.shortlink.api_url = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        cfg.shortlink.enabled = false;
        validate(&cfg).unwrap();
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.run_timeout_seconds = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        let mut f = fs::File::create(&p).unwrap();
        f.write_all(example().as_bytes()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.app.utc_offset_minutes, -300);
        assert_eq!(cfg.shortlink.source_tag, "digest");
    }
}
