//! Daemon configuration loading.
//!
//! TOML is the sole config source: a single file, loaded once at startup. A
//! missing file falls back to compiled-in defaults for everything; a file
//! that parses as TOML but has the wrong shape for a recognized key fails
//! the whole load, per the fail-closed decision in `SPEC_FULL.md` §9.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config types (validated, with defaults applied)
// ---------------------------------------------------------------------------

/// Top-level daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub socket_path: String,
    pub encrypted_uids_file: String,
    pub max_server_connections: u32,
    pub max_auth_request_wait: Duration,
    pub client_force_close_socket_timeout: Duration,
    pub uids_translation_table: HashMap<String, String>,
    pub remote_user_parent_process_names: Vec<String>,
    pub readers: ReaderConfig,
}

/// Per-backend reader settings. Only the knobs the core dispatches on are
/// represented here; backend-internal wire parameters (device paths,
/// baud rates, server addresses) are out of scope (`SPEC_FULL.md` §1) and
/// are threaded through as opaque strings for the backend stand-ins to use
/// or ignore.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub pcsc: BackendConfig,
    pub serial: BackendConfig,
    pub hid: BackendConfig,
    pub proxmark: BackendConfig,
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub enabled: bool,
    pub read_every: Duration,
    pub inactive_timeout: Duration,
    pub target: Option<String>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ReaderConfig {
            pcsc: BackendConfig {
                enabled: true,
                read_every: Duration::from_millis(200),
                inactive_timeout: Duration::from_secs(1),
                target: None,
            },
            serial: BackendConfig {
                enabled: false,
                read_every: Duration::from_millis(200),
                inactive_timeout: Duration::from_secs(1),
                target: Some("/dev/ttyUSB0".to_owned()),
            },
            hid: BackendConfig {
                enabled: false,
                read_every: Duration::from_millis(200),
                inactive_timeout: Duration::from_secs(1),
                target: None,
            },
            proxmark: BackendConfig {
                enabled: false,
                read_every: Duration::from_millis(200),
                inactive_timeout: Duration::from_secs(2),
                target: Some("/dev/ttyACM0".to_owned()),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket_path: "/tmp/tagauthd.socket".to_owned(),
            encrypted_uids_file: "/etc/tagauthd_uids.json".to_owned(),
            max_server_connections: 10,
            max_auth_request_wait: Duration::from_secs(60),
            client_force_close_socket_timeout: Duration::from_secs(60),
            uids_translation_table: HashMap::new(),
            remote_user_parent_process_names: vec!["sshd".to_owned(), "telnetd".to_owned()],
            readers: ReaderConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (everything optional; defaults fill gaps)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    socket_path: Option<String>,
    encrypted_uids_file: Option<String>,
    max_server_connections: Option<u32>,
    max_auth_request_wait: Option<f64>,
    client_force_close_socket_timeout: Option<f64>,
    uids_translation_table: Option<HashMap<String, String>>,
    remote_user_parent_process_names: Option<Vec<String>>,
    watch_pcsc: Option<bool>,
    pcsc_read_every: Option<f64>,
    watch_serial: Option<bool>,
    serial_read_every: Option<f64>,
    serial_dev_file: Option<String>,
    serial_uid_not_sent_inactive_timeout: Option<f64>,
    watch_hid: Option<bool>,
    hid_read_every: Option<f64>,
    hid_simulate_uid_stays_active: Option<f64>,
    watch_pm3: Option<bool>,
    pm3_read_every: Option<f64>,
    pm3_dev_file: Option<String>,
    pm3_client_comm_timeout: Option<f64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from a custom path. A missing file is treated as "use all
/// defaults"; a present-but-malformed file is an error.
pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(toml_str) => load_config_from_str(&toml_str),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
        Err(e) => Err(ConfigError::Io(format!(
            "reading config file '{}': {}",
            path.display(),
            e
        ))),
    }
}

/// Load config from the default path `/etc/tagauthd/config.toml`.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from_path(Path::new("/etc/tagauthd/config.toml"))
}

/// Load config from a TOML string, applying defaults to absent keys.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let defaults = Config::default();

    let max_auth_request_wait = match raw.max_auth_request_wait {
        Some(secs) => duration_from_secs(secs, "max_auth_request_wait")?,
        None => defaults.max_auth_request_wait,
    };
    let client_force_close_socket_timeout = match raw.client_force_close_socket_timeout {
        Some(secs) => duration_from_secs(secs, "client_force_close_socket_timeout")?,
        None => defaults.client_force_close_socket_timeout,
    };

    let mut readers = ReaderConfig::default();
    if let Some(v) = raw.watch_pcsc {
        readers.pcsc.enabled = v;
    }
    if let Some(secs) = raw.pcsc_read_every {
        readers.pcsc.read_every = duration_from_secs(secs, "pcsc_read_every")?;
    }
    if let Some(v) = raw.watch_serial {
        readers.serial.enabled = v;
    }
    if let Some(secs) = raw.serial_read_every {
        readers.serial.read_every = duration_from_secs(secs, "serial_read_every")?;
    }
    if let Some(dev) = raw.serial_dev_file {
        readers.serial.target = Some(dev);
    }
    if let Some(secs) = raw.serial_uid_not_sent_inactive_timeout {
        readers.serial.inactive_timeout =
            duration_from_secs(secs, "serial_uid_not_sent_inactive_timeout")?;
    }
    if let Some(v) = raw.watch_hid {
        readers.hid.enabled = v;
    }
    if let Some(secs) = raw.hid_read_every {
        readers.hid.read_every = duration_from_secs(secs, "hid_read_every")?;
    }
    if let Some(secs) = raw.hid_simulate_uid_stays_active {
        readers.hid.inactive_timeout = duration_from_secs(secs, "hid_simulate_uid_stays_active")?;
    }
    if let Some(v) = raw.watch_pm3 {
        readers.proxmark.enabled = v;
    }
    if let Some(secs) = raw.pm3_read_every {
        readers.proxmark.read_every = duration_from_secs(secs, "pm3_read_every")?;
    }
    if let Some(dev) = raw.pm3_dev_file {
        readers.proxmark.target = Some(dev);
    }
    if let Some(secs) = raw.pm3_client_comm_timeout {
        readers.proxmark.inactive_timeout = duration_from_secs(secs, "pm3_client_comm_timeout")?;
    }

    Ok(Config {
        socket_path: raw.socket_path.unwrap_or(defaults.socket_path),
        encrypted_uids_file: raw.encrypted_uids_file.unwrap_or(defaults.encrypted_uids_file),
        max_server_connections: raw
            .max_server_connections
            .unwrap_or(defaults.max_server_connections),
        max_auth_request_wait,
        client_force_close_socket_timeout,
        uids_translation_table: raw
            .uids_translation_table
            .unwrap_or(defaults.uids_translation_table),
        remote_user_parent_process_names: raw
            .remote_user_parent_process_names
            .unwrap_or(defaults.remote_user_parent_process_names),
        readers,
    })
}

fn duration_from_secs(secs: f64, field: &'static str) -> Result<Duration, ConfigError> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(ConfigError::InvalidValue(format!(
            "{field} must be a non-negative number of seconds, got {secs}"
        )));
    }
    Ok(Duration::from_secs_f64(secs))
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = load_config_from_path(Path::new("/nonexistent/tagauthd.toml")).unwrap();
        assert_eq!(cfg.socket_path, Config::default().socket_path);
    }

    #[test]
    fn empty_string_yields_defaults() {
        let cfg = load_config_from_str("").unwrap();
        assert_eq!(cfg.max_server_connections, 10);
        assert!(cfg.readers.pcsc.enabled);
        assert!(!cfg.readers.serial.enabled);
    }

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let cfg = load_config_from_str(
            r#"
            socket_path = "/run/tagauthd.sock"
            watch_serial = true
            serial_read_every = 0.5
            max_auth_request_wait = 30

            [uids_translation_table]
            "DEADBEEF" = "CAFE1234"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.socket_path, "/run/tagauthd.sock");
        assert!(cfg.readers.serial.enabled);
        assert_eq!(cfg.readers.serial.read_every, Duration::from_millis(500));
        assert_eq!(cfg.max_auth_request_wait, Duration::from_secs(30));
        assert_eq!(
            cfg.uids_translation_table.get("DEADBEEF").map(String::as_str),
            Some("CAFE1234")
        );
    }

    #[test]
    fn malformed_toml_fails_closed() {
        let err = load_config_from_str("this is not valid = = toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn negative_timeout_is_rejected() {
        let err = load_config_from_str("max_auth_request_wait = -5").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }
}
