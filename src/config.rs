//! Declarative policy configuration.
//!
//! Loaded from a TOML file; reloadable at runtime (SIGHUP). A failed
//! reload leaves the previous configuration in force.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::P2pError;
use crate::timing::SelectTimeouts;

pub const AUTO_INTERFACE: &str = "auto";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Control-client interface name, or `auto` to pick the first
    /// `p2p-dev-*` the client reports.
    pub interface: String,
    /// External control-client program.
    pub p2p_client: String,
    /// Static WPS PIN for keypad enrolment.
    pub pin: String,
    /// External supplier program printing a fresh PIN per call; overrides
    /// the static PIN when set.
    pub pin_program: Option<String>,
    /// Enrolment method: true = PBC, false = keypad/PIN, unset = ask the
    /// supplicant for its configured methods.
    pub pbc_in_use: Option<bool>,
    /// Start a persistent group at startup.
    pub activate_persistent_group: bool,
    /// Start an autonomous group at startup (persistent wins if both set).
    pub activate_autonomous_group: bool,
    /// Restrict persistent activation to one network entry.
    pub persistent_network_id: Option<u32>,
    /// Remove the group after its last session disconnects.
    pub dynamic_group: bool,
    /// Friendly names permitted to enroll via PBC (empty = everyone).
    pub pbc_white_list: Vec<String>,
    /// `set_network` parameters applied to a freshly added network.
    pub network_parms: Vec<String>,
    /// Supplicant-wide `set` parameters pushed on startup.
    pub config_parms: BTreeMap<String, String>,
    /// Postfix appended to auto-generated group SSIDs.
    pub ssid_postfix: Option<String>,
    /// Free-form tail appended to `p2p_group_add`.
    pub p2p_group_add_opts: Option<String>,
    /// Free-form tail appended to `p2p_connect` / `p2p_invite`.
    pub p2p_connect_opts: Option<String>,
    pub select_timeout_secs: SelectTimeouts,
    /// Seconds between consecutive connect/enrol attempts.
    pub min_conn_delay: u64,
    /// Bound on automatic connect retries.
    pub max_num_failures: u32,
    /// Fatal threshold on consecutive control-client errors.
    pub max_num_wpa_cli_failures: u32,
    /// Consecutive empty `p2p_find` probes before the long level
    /// (0 = never back off).
    pub max_scan_polling: u32,
    /// Seconds a station is given to complete the WPS dialogue.
    pub max_negotiation_time: u64,
    /// Call `save_config` after mutating networks.
    pub save_config_enabled: bool,
    /// Suppress connection-error warnings until this many were counted.
    pub wpa_supplicant_min_err_warn: u32,
    /// External hook program (opaque to the engine).
    pub run_program: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: AUTO_INTERFACE.to_string(),
            p2p_client: "wpa_cli".to_string(),
            pin: "00000000".to_string(),
            pin_program: None,
            pbc_in_use: None,
            activate_persistent_group: true,
            activate_autonomous_group: false,
            persistent_network_id: None,
            dynamic_group: false,
            pbc_white_list: Vec::new(),
            network_parms: Vec::new(),
            config_parms: BTreeMap::new(),
            ssid_postfix: None,
            p2p_group_add_opts: None,
            p2p_connect_opts: None,
            select_timeout_secs: SelectTimeouts::default(),
            min_conn_delay: 40,
            max_num_failures: 3,
            max_num_wpa_cli_failures: 9,
            max_scan_polling: 2,
            max_negotiation_time: 120,
            save_config_enabled: true,
            wpa_supplicant_min_err_warn: 0,
            run_program: None,
        }
    }
}

impl Config {
    /// Load and validate a configuration file. Unknown keys and wrong
    /// scalar types are configuration errors.
    pub fn load(path: &Path) -> Result<Config, P2pError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            P2pError::Config(format!("cannot open {}: {e}", path.display()))
        })?;
        let mut config: Config = toml::from_str(&text).map_err(|e| {
            P2pError::Config(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        debug!("configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Resolve inconsistent settings; the persistent startup group wins
    /// over the autonomous one when both are requested.
    pub fn validate(&mut self) -> Result<(), P2pError> {
        if self.activate_persistent_group && self.activate_autonomous_group {
            error!(
                "activate_persistent_group and activate_autonomous_group are \
                 both active; considering persistent group"
            );
            self.activate_autonomous_group = false;
        }
        if self.interface.trim().is_empty() {
            return Err(P2pError::InvalidInterface(self.interface.clone()));
        }
        if self.pin.is_empty() && self.pin_program.is_none() {
            return Err(P2pError::Config("empty pin with no pin_program".into()));
        }
        Ok(())
    }

    pub fn min_conn_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.min_conn_delay)
    }

    pub fn max_negotiation_time(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.max_negotiation_time)
    }

    /// The hook program, unless disabled (empty, blank or `-`).
    pub fn hook_program(&self) -> Option<&str> {
        match self.run_program.as_deref() {
            Some(p) if !p.trim().is_empty() && p != "-" => Some(p),
            _ => None,
        }
    }
}

/// Reload `*current` from `path`, keeping the old configuration when the
/// new one fails to load or validate. The `interface` field keeps an
/// already-resolved interface when the file says `auto`.
pub fn reload(current: &mut Config, path: &Path) -> Result<(), P2pError> {
    let mut fresh = Config::load(path)?;
    if fresh.interface == AUTO_INTERFACE && current.interface != AUTO_INTERFACE {
        fresh.interface = current.interface.clone();
    }
    *current = fresh;
    Ok(())
}

/// Where to look for the configuration file when none was given.
pub fn default_config_file() -> PathBuf {
    PathBuf::from("/etc/wifi-direct-go.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(content: &str) -> PathBuf {
        static COUNTER: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "wifi-direct-go-test-{}-{n}.toml",
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn defaults_match_policy() {
        let config = Config::default();
        assert_eq!(config.interface, "auto");
        assert_eq!(config.p2p_client, "wpa_cli");
        assert_eq!(config.pin, "00000000");
        assert!(config.activate_persistent_group);
        assert!(!config.dynamic_group);
        assert_eq!(config.min_conn_delay, 40);
        assert_eq!(config.max_num_wpa_cli_failures, 9);
        assert_eq!(config.max_scan_polling, 2);
        assert!(config.pbc_in_use.is_none());
    }

    #[test]
    fn loads_partial_file_over_defaults() {
        let path = write_temp(
            r#"
interface = "p2p-dev-wlan0"
dynamic_group = true
pbc_white_list = ["alice", "bob"]

[select_timeout_secs]
normal = 5
"#,
        );
        let config = Config::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.interface, "p2p-dev-wlan0");
        assert!(config.dynamic_group);
        assert_eq!(config.pbc_white_list, vec!["alice", "bob"]);
        assert_eq!(config.select_timeout_secs.normal, 5);
        assert_eq!(config.select_timeout_secs.connect, 90);
    }

    #[test]
    fn unknown_key_is_an_error() {
        let path = write_temp("no_such_key = 1\n");
        let err = Config::load(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, P2pError::Config(_)));
    }

    #[test]
    fn wrong_scalar_type_is_an_error() {
        let path = write_temp("min_conn_delay = \"soon\"\n");
        let err = Config::load(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, P2pError::Config(_)));
    }

    #[test]
    fn persistent_wins_over_autonomous() {
        let mut config = Config {
            activate_persistent_group: true,
            activate_autonomous_group: true,
            ..Config::default()
        };
        config.validate().unwrap();
        assert!(config.activate_persistent_group);
        assert!(!config.activate_autonomous_group);
    }

    #[test]
    fn failed_reload_keeps_previous_configuration() {
        let mut current = Config {
            min_conn_delay: 7,
            ..Config::default()
        };
        let path = write_temp("min_conn_delay = [1, 2]\n");
        assert!(reload(&mut current, &path).is_err());
        std::fs::remove_file(&path).ok();
        assert_eq!(current.min_conn_delay, 7);
    }

    #[test]
    fn reload_keeps_resolved_interface() {
        let mut current = Config {
            interface: "p2p-dev-wlan0".to_string(),
            ..Config::default()
        };
        let path = write_temp("dynamic_group = true\n");
        reload(&mut current, &path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(current.interface, "p2p-dev-wlan0");
        assert!(current.dynamic_group);
    }

    #[test]
    fn hook_program_disabled_forms() {
        let mut config = Config::default();
        assert_eq!(config.hook_program(), None);
        config.run_program = Some("-".to_string());
        assert_eq!(config.hook_program(), None);
        config.run_program = Some("  ".to_string());
        assert_eq!(config.hook_program(), None);
        config.run_program = Some("/usr/local/bin/p2p-hook".to_string());
        assert_eq!(config.hook_program(), Some("/usr/local/bin/p2p-hook"));
    }
}
