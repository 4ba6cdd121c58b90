//! Configuration module for the profile service.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::key::{OhSuffixPolicy, SEPARATOR};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub store: StoreConfig,
    pub profile: ProfileConfig,
    pub multi_user: MultiUserConfig,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
}

/// Identity of the local device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Unique device id; prefixes every local profile key.
    pub udid: String,
    /// Replica id recorded as the owner of locally written KV entries.
    pub uuid: String,
}

/// Storage locations and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database holding the trust tables.
    pub rdb_path: PathBuf,
    /// SQLite database backing the KV store.
    pub kv_path: PathBuf,
    /// Backup file used to restore the trust database after corruption.
    pub backup_path: PathBuf,
    /// Store id of the dynamic profile KV store.
    pub kv_store_id: String,
    /// Store id of the static profile KV store; its changes are not delivered.
    pub static_store_id: String,
    /// Attempts made to open a store before giving up.
    pub init_max_attempts: u32,
    /// Delay between open attempts, in milliseconds.
    pub init_retry_interval_ms: u64,
}

/// Limits and key-suffix rules for profile data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Maximum length of any identifier accepted by the service.
    pub max_string_len: usize,
    /// Change batches larger than this are dropped by the change listener.
    pub max_db_record_size: usize,
    /// Device attributes written with the `_OH` suffix.
    pub oh_suffix_device_attributes: Vec<String>,
    /// Service names written with the `_OH` suffix.
    pub oh_suffix_services: Vec<String>,
    /// Services that only OH peers publish; removed from non-OH peers' data.
    pub non_oh_denylist_services: Vec<String>,
}

/// Valid user id range and the foreground user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiUserConfig {
    pub min_user_id: i32,
    pub max_user_id: i32,
    /// User whose multi-user profiles also populate the suffix-less keys.
    pub foreground_user_id: i32,
}

/// Reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Push+pull the dynamic store directly with peers that come online.
    pub e2e_sync: bool,
    /// Capacity of the background task queue.
    pub queue_capacity: usize,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/dprofile/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("dprofile")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("~/.local/share"))
        .join("dprofile")
}

impl Default for StoreConfig {
    fn default() -> Self {
        let dir = data_dir();
        Self {
            rdb_path: dir.join("trust_profile.db"),
            kv_path: dir.join("dp_kv_store.db"),
            backup_path: dir.join("trust_profile.db.bak"),
            kv_store_id: "dp_kv_store".to_string(),
            static_store_id: "dp_kv_static_store".to_string(),
            init_max_attempts: 3,
            init_retry_interval_ms: 200,
        }
    }
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            max_string_len: 256,
            max_db_record_size: 10_000,
            oh_suffix_device_attributes: vec!["osType".to_string(), "osVersion".to_string()],
            oh_suffix_services: vec!["distributeDeviceProfile".to_string()],
            non_oh_denylist_services: vec![
                "distributeDeviceProfile".to_string(),
                "collaborationFwk".to_string(),
            ],
        }
    }
}

impl Default for MultiUserConfig {
    fn default() -> Self {
        Self {
            min_user_id: 0,
            max_user_id: 100_000,
            foreground_user_id: 100,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            e2e_sync: false,
            queue_capacity: 256,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl ProfileConfig {
    /// Suffix rules built from the configured name sets
    pub fn oh_suffix_policy(&self) -> OhSuffixPolicy {
        OhSuffixPolicy::new(
            self.oh_suffix_device_attributes.iter().cloned(),
            self.oh_suffix_services.iter().cloned(),
        )
    }
}

impl MultiUserConfig {
    pub fn contains(&self, user_id: i32) -> bool {
        (self.min_user_id..=self.max_user_id).contains(&user_id)
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"store.kv_store_id"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- device ---
        for (field, value) in [("device.udid", &self.device.udid), ("device.uuid", &self.device.uuid)] {
            if value.contains(SEPARATOR) {
                errors.push(ValidationError {
                    field: field.into(),
                    message: format!("must not contain '{SEPARATOR}'"),
                });
            }
            if value.len() > self.profile.max_string_len {
                errors.push(ValidationError {
                    field: field.into(),
                    message: format!("longer than {} characters", self.profile.max_string_len),
                });
            }
        }

        // --- store ---
        if self.store.kv_store_id.is_empty() {
            errors.push(ValidationError {
                field: "store.kv_store_id".into(),
                message: "must not be empty".into(),
            });
        }
        if self.store.kv_store_id == self.store.static_store_id {
            errors.push(ValidationError {
                field: "store.static_store_id".into(),
                message: "must differ from store.kv_store_id".into(),
            });
        }
        if self.store.init_max_attempts == 0 {
            errors.push(ValidationError {
                field: "store.init_max_attempts".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.store.rdb_path == self.store.backup_path {
            errors.push(ValidationError {
                field: "store.backup_path".into(),
                message: "must differ from store.rdb_path".into(),
            });
        }

        // --- profile ---
        if self.profile.max_string_len == 0 {
            errors.push(ValidationError {
                field: "profile.max_string_len".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.profile.max_db_record_size == 0 {
            errors.push(ValidationError {
                field: "profile.max_db_record_size".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- multi_user ---
        if self.multi_user.min_user_id > self.multi_user.max_user_id {
            errors.push(ValidationError {
                field: "multi_user.min_user_id".into(),
                message: format!(
                    "min_user_id ({}) must not exceed max_user_id ({})",
                    self.multi_user.min_user_id, self.multi_user.max_user_id
                ),
            });
        }
        if !self.multi_user.contains(self.multi_user.foreground_user_id) {
            errors.push(ValidationError {
                field: "multi_user.foreground_user_id".into(),
                message: "must be within min_user_id..=max_user_id".into(),
            });
        }

        // --- sync ---
        if self.sync.queue_capacity == 0 {
            errors.push(ValidationError {
                field: "sync.queue_capacity".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use dprofile_core::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .device_udid("local-udid")
///     .device_uuid("local-uuid")
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- device ---

    pub fn device_udid(mut self, udid: impl Into<String>) -> Self {
        self.config.device.udid = udid.into();
        self
    }

    pub fn device_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.config.device.uuid = uuid.into();
        self
    }

    // --- store ---

    pub fn store_rdb_path(mut self, path: PathBuf) -> Self {
        self.config.store.rdb_path = path;
        self
    }

    pub fn store_kv_path(mut self, path: PathBuf) -> Self {
        self.config.store.kv_path = path;
        self
    }

    pub fn store_backup_path(mut self, path: PathBuf) -> Self {
        self.config.store.backup_path = path;
        self
    }

    pub fn store_init_max_attempts(mut self, n: u32) -> Self {
        self.config.store.init_max_attempts = n;
        self
    }

    pub fn store_init_retry_interval_ms(mut self, ms: u64) -> Self {
        self.config.store.init_retry_interval_ms = ms;
        self
    }

    // --- profile ---

    pub fn profile_max_string_len(mut self, len: usize) -> Self {
        self.config.profile.max_string_len = len;
        self
    }

    pub fn profile_max_db_record_size(mut self, size: usize) -> Self {
        self.config.profile.max_db_record_size = size;
        self
    }

    pub fn profile_oh_suffix_device_attributes(mut self, names: Vec<String>) -> Self {
        self.config.profile.oh_suffix_device_attributes = names;
        self
    }

    pub fn profile_oh_suffix_services(mut self, names: Vec<String>) -> Self {
        self.config.profile.oh_suffix_services = names;
        self
    }

    pub fn profile_non_oh_denylist_services(mut self, names: Vec<String>) -> Self {
        self.config.profile.non_oh_denylist_services = names;
        self
    }

    // --- multi_user ---

    pub fn multi_user_range(mut self, min: i32, max: i32) -> Self {
        self.config.multi_user.min_user_id = min;
        self.config.multi_user.max_user_id = max;
        self
    }

    pub fn multi_user_foreground(mut self, user_id: i32) -> Self {
        self.config.multi_user.foreground_user_id = user_id;
        self
    }

    // --- sync ---

    pub fn sync_e2e(mut self, enabled: bool) -> Self {
        self.config.sync.e2e_sync = enabled;
        self
    }

    pub fn sync_queue_capacity(mut self, n: usize) -> Self {
        self.config.sync.queue_capacity = n;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_json(mut self, json: bool) -> Self {
        self.config.logging.json = json;
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    // -- Defaults --

    #[test]
    fn default_config_has_sensible_values() {
        let cfg = Config::default();
        assert_eq!(cfg.store.kv_store_id, "dp_kv_store");
        assert_eq!(cfg.store.static_store_id, "dp_kv_static_store");
        assert_eq!(cfg.store.init_max_attempts, 3);
        assert_eq!(cfg.profile.max_string_len, 256);
        assert_eq!(cfg.profile.max_db_record_size, 10_000);
        assert_eq!(cfg.multi_user.min_user_id, 0);
        assert_eq!(cfg.multi_user.max_user_id, 100_000);
        assert!(!cfg.sync.e2e_sync);
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
        assert!(cfg.store.rdb_path.to_string_lossy().contains("dprofile"));
    }

    #[test]
    fn default_config_passes_validation() {
        let cfg = Config::default();
        let errors = cfg.validate();
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }

    // -- Loading --

    #[test]
    fn load_from_yaml_file() {
        let yaml = r#"
device:
  udid: "udid-local"
  uuid: "uuid-local"
store:
  kv_store_id: "kv"
  static_store_id: "kv_static"
  init_max_attempts: 5
profile:
  max_string_len: 64
  oh_suffix_services: ["camera"]
multi_user:
  foreground_user_id: 101
sync:
  e2e_sync: true
logging:
  level: "debug"
  json: true
"#;
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(yaml.as_bytes()).expect("write yaml");

        let cfg = Config::load(tmp.path()).expect("load config");
        assert_eq!(cfg.device.udid, "udid-local");
        assert_eq!(cfg.device.uuid, "uuid-local");
        assert_eq!(cfg.store.kv_store_id, "kv");
        assert_eq!(cfg.store.init_max_attempts, 5);
        assert_eq!(cfg.profile.max_string_len, 64);
        assert_eq!(cfg.profile.oh_suffix_services, vec!["camera".to_string()]);
        // Unspecified fields keep their defaults
        assert_eq!(cfg.profile.max_db_record_size, 10_000);
        assert_eq!(cfg.multi_user.foreground_user_id, 101);
        assert!(cfg.sync.e2e_sync);
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
    }

    #[test]
    fn load_or_default_returns_default_on_missing_file() {
        let cfg = Config::load_or_default(Path::new("/nonexistent/path/config.yaml"));
        assert_eq!(cfg.store.kv_store_id, "dp_kv_store");
    }

    #[test]
    fn load_returns_error_on_invalid_yaml() {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(b"device: [not, a, map").expect("write yaml");
        assert!(Config::load(tmp.path()).is_err());
    }

    // -- Validation --

    #[test]
    fn validate_rejects_separator_in_device_ids() {
        let cfg = ConfigBuilder::new().device_udid("bad#udid").build();
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "device.udid"));
    }

    #[test]
    fn validate_catches_same_store_ids() {
        let mut cfg = Config::default();
        cfg.store.static_store_id = cfg.store.kv_store_id.clone();
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "store.static_store_id"));
    }

    #[test]
    fn validate_catches_zero_limits() {
        let cfg = ConfigBuilder::new()
            .store_init_max_attempts(0)
            .profile_max_string_len(0)
            .profile_max_db_record_size(0)
            .sync_queue_capacity(0)
            .build();
        let fields: Vec<String> = cfg.validate().into_iter().map(|e| e.field).collect();
        assert!(fields.contains(&"store.init_max_attempts".to_string()));
        assert!(fields.contains(&"profile.max_string_len".to_string()));
        assert!(fields.contains(&"profile.max_db_record_size".to_string()));
        assert!(fields.contains(&"sync.queue_capacity".to_string()));
    }

    #[test]
    fn validate_catches_inverted_user_range() {
        let cfg = ConfigBuilder::new().multi_user_range(10, 1).build();
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "multi_user.min_user_id"));
        assert!(errors
            .iter()
            .any(|e| e.field == "multi_user.foreground_user_id"));
    }

    #[test]
    fn validate_catches_invalid_log_level() {
        let cfg = ConfigBuilder::new().logging_level("verbose").build();
        let errors = cfg.validate();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "logging.level");
    }

    #[test]
    fn validate_accepts_all_valid_log_levels() {
        for level in VALID_LOG_LEVELS {
            let cfg = ConfigBuilder::new().logging_level(*level).build();
            assert!(cfg.validate().is_empty(), "level {level} rejected");
        }
    }

    // -- Builder --

    #[test]
    fn builder_overrides_fields() {
        let cfg = ConfigBuilder::new()
            .device_udid("u")
            .device_uuid("r")
            .store_rdb_path(PathBuf::from("/tmp/a.db"))
            .store_kv_path(PathBuf::from("/tmp/kv.db"))
            .store_backup_path(PathBuf::from("/tmp/a.bak"))
            .store_init_retry_interval_ms(5)
            .profile_oh_suffix_device_attributes(vec!["osType".into()])
            .profile_non_oh_denylist_services(vec!["svc".into()])
            .multi_user_foreground(7)
            .sync_e2e(true)
            .logging_json(true)
            .build();
        assert_eq!(cfg.device.udid, "u");
        assert_eq!(cfg.device.uuid, "r");
        assert_eq!(cfg.store.rdb_path, PathBuf::from("/tmp/a.db"));
        assert_eq!(cfg.store.init_retry_interval_ms, 5);
        assert_eq!(cfg.profile.non_oh_denylist_services, vec!["svc".to_string()]);
        assert_eq!(cfg.multi_user.foreground_user_id, 7);
        assert!(cfg.sync.e2e_sync);
        assert!(cfg.logging.json);
    }

    #[test]
    fn builder_build_validated_fails_for_invalid_config() {
        let result = ConfigBuilder::new().logging_level("loud").build_validated();
        assert!(result.is_err());
        assert!(ConfigBuilder::new().build_validated().is_ok());
    }

    #[test]
    fn suffix_policy_follows_profile_section() {
        use crate::domain::ProfileKey;

        let cfg = ConfigBuilder::new()
            .profile_oh_suffix_services(vec!["camera".into()])
            .build();
        let policy = cfg.profile.oh_suffix_policy();
        let key = ProfileKey::parse("svr#u#camera#serviceType").expect("valid key");
        assert!(policy.needs_suffix(&key));
    }

    #[test]
    fn default_path_ends_with_config_yaml() {
        let path = Config::default_path();
        assert!(path.ends_with("dprofile/config.yaml"));
    }

    #[test]
    fn validation_error_display() {
        let err = ValidationError {
            field: "store.kv_store_id".into(),
            message: "must not be empty".into(),
        };
        assert_eq!(err.to_string(), "store.kv_store_id: must not be empty");
    }
}
