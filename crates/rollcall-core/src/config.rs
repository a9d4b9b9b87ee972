use crate::matcher::DEFAULT_MATCH_THRESHOLD;
use crate::window::DuplicateWindow;
use chrono::{Duration, FixedOffset};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which duplicate-window policy the ledger applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WindowKind {
    CalendarDay,
    Rolling,
    Disabled,
}

impl FromStr for WindowKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "calendar-day" => Ok(Self::CalendarDay),
            "rolling" => Ok(Self::Rolling),
            "disabled" => Ok(Self::Disabled),
            other => Err(ConfigError::Invalid(format!("unknown duplicate window {other:?}"))),
        }
    }
}

/// D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(Self::Session),
            "system" => Ok(Self::System),
            other => Err(ConfigError::Invalid(format!("unknown bus {other:?}"))),
        }
    }
}

/// Shared configuration for the daemon and the CLI.
///
/// Resolution order: built-in defaults, then an optional TOML file, then
/// `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Maximum Euclidean distance for a positive match.
    pub match_threshold: f64,
    pub duplicate_window: WindowKind,
    /// Span of the rolling window, in minutes.
    pub window_minutes: i64,
    /// UTC offset used to decide calendar-day boundaries, in minutes.
    pub day_utc_offset_minutes: i32,
    /// Per-request timeout applied by the daemon.
    pub request_timeout_secs: u64,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        Self {
            db_path: data_dir.join("attendance.db"),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            duplicate_window: WindowKind::CalendarDay,
            window_minutes: 60,
            day_utc_offset_minutes: 0,
            request_timeout_secs: 10,
            bus: BusKind::System,
        }
    }
}

impl Config {
    /// Load configuration from `path` (or `ROLLCALL_CONFIG`), apply
    /// environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("ROLLCALL_CONFIG").ok().map(PathBuf::from));

        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                tracing::debug!(path = %path.display(), "loaded config file");
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };

        config.apply_env_from(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `ROLLCALL_*` overrides. Unparseable values are ignored with a warning.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        self.match_threshold =
            env_parse(&lookup, "ROLLCALL_MATCH_THRESHOLD", self.match_threshold);
        self.duplicate_window =
            env_parse(&lookup, "ROLLCALL_DUPLICATE_WINDOW", self.duplicate_window);
        self.window_minutes = env_parse(&lookup, "ROLLCALL_WINDOW_MINUTES", self.window_minutes);
        self.day_utc_offset_minutes = env_parse(
            &lookup,
            "ROLLCALL_DAY_UTC_OFFSET_MINUTES",
            self.day_utc_offset_minutes,
        );
        self.request_timeout_secs =
            env_parse(&lookup, "ROLLCALL_REQUEST_TIMEOUT_SECS", self.request_timeout_secs);
        self.bus = env_parse(&lookup, "ROLLCALL_BUS", self.bus);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.match_threshold.is_finite() || self.match_threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be finite and non-negative, got {}",
                self.match_threshold
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request_timeout_secs must be positive".into()));
        }
        self.window()?;
        Ok(())
    }

    /// Build the ledger's duplicate-window policy.
    pub fn window(&self) -> Result<DuplicateWindow, ConfigError> {
        match self.duplicate_window {
            WindowKind::CalendarDay => {
                let utc_offset = self
                    .day_utc_offset_minutes
                    .checked_mul(60)
                    .and_then(FixedOffset::east_opt)
                    .ok_or_else(|| {
                        ConfigError::Invalid(format!(
                            "day_utc_offset_minutes out of range: {}",
                            self.day_utc_offset_minutes
                        ))
                    })?;
                Ok(DuplicateWindow::CalendarDay { utc_offset })
            }
            WindowKind::Rolling => {
                let span = Duration::try_minutes(self.window_minutes)
                    .filter(|d| *d > Duration::zero())
                    .ok_or_else(|| {
                        ConfigError::Invalid(format!(
                            "window_minutes must be positive, got {}",
                            self.window_minutes
                        ))
                    })?;
                Ok(DuplicateWindow::Rolling(span))
            }
            WindowKind::Disabled => Ok(DuplicateWindow::Disabled),
        }
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}

fn env_parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    match lookup(key) {
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
                current
            }
        },
        None => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.duplicate_window, WindowKind::CalendarDay);
        assert!(config.db_path.ends_with("rollcall/attendance.db"));
        assert!(config.validate().is_ok());
        assert_eq!(config.window().unwrap(), DuplicateWindow::default());
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config = Config::from_toml(
            r#"
            db_path = "/var/lib/rollcall/attendance.db"
            match_threshold = 0.45
            duplicate_window = "rolling"
            window_minutes = 20
            bus = "session"
            "#,
        )
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/rollcall/attendance.db"));
        assert_eq!(config.match_threshold, 0.45);
        assert_eq!(config.bus, BusKind::Session);
        assert_eq!(config.window().unwrap(), DuplicateWindow::Rolling(Duration::minutes(20)));
        // Unspecified keys keep their defaults.
        assert_eq!(config.request_timeout_secs, 10);
    }

    #[test]
    fn test_unknown_toml_key_rejected() {
        assert!(matches!(
            Config::from_toml("threshold = 0.5"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::from_toml("match_threshold = 0.45").unwrap();
        config.apply_env_from(env(&[
            ("ROLLCALL_MATCH_THRESHOLD", "0.5"),
            ("ROLLCALL_DUPLICATE_WINDOW", "disabled"),
            ("ROLLCALL_DB_PATH", "/tmp/a.db"),
        ]));
        assert_eq!(config.match_threshold, 0.5);
        assert_eq!(config.duplicate_window, WindowKind::Disabled);
        assert_eq!(config.db_path, PathBuf::from("/tmp/a.db"));
    }

    #[test]
    fn test_bad_env_value_keeps_current() {
        let mut config = Config::default();
        config.apply_env_from(env(&[
            ("ROLLCALL_MATCH_THRESHOLD", "close-enough"),
            ("ROLLCALL_BUS", "tram"),
        ]));
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.bus, BusKind::System);
    }

    #[test]
    fn test_calendar_day_offset() {
        let config = Config {
            day_utc_offset_minutes: 330,
            ..Config::default()
        };
        assert_eq!(
            config.window().unwrap(),
            DuplicateWindow::CalendarDay {
                utc_offset: FixedOffset::east_opt(330 * 60).unwrap()
            }
        );
    }

    #[test]
    fn test_validation_failures() {
        let negative = Config {
            match_threshold: -1.0,
            ..Config::default()
        };
        assert!(negative.validate().is_err());

        let zero_window = Config {
            duplicate_window: WindowKind::Rolling,
            window_minutes: 0,
            ..Config::default()
        };
        assert!(zero_window.validate().is_err());

        let bad_offset = Config {
            day_utc_offset_minutes: 24 * 60,
            ..Config::default()
        };
        assert!(bad_offset.validate().is_err());
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(
            &path,
            "match_threshold = 0.5\nduplicate_window = \"disabled\"\nrequest_timeout_secs = 3\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.match_threshold, 0.5);
        assert_eq!(config.window().unwrap(), DuplicateWindow::Disabled);
        assert_eq!(config.request_timeout(), std::time::Duration::from_secs(3));
    }

    #[test]
    fn test_load_missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        match Config::load(Some(&path)) {
            Err(ConfigError::Read { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("expected Read error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_validates_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(&path, "match_threshold = -0.5\n").unwrap();
        assert!(matches!(
            Config::load(Some(&path)),
            Err(ConfigError::Invalid(_))
        ));
    }
}
