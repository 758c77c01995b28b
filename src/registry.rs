//! Peer address registry and event statistics.
//!
//! Each process owns a local copy; Enroller updates cross the process
//! boundary as `HOSTP2PD_ADD_REGISTER` records on the shared pty and are
//! idempotent per MAC.

use std::collections::HashMap;

pub const UNKNOWN_NAME: &str = "[unknown]";

/// MAC address → last-seen friendly name and device-type label.
#[derive(Debug, Default)]
pub struct AddressRegistry {
    names: HashMap<String, String>,
    device_types: HashMap<String, String>,
}

impl AddressRegistry {
    pub fn record(&mut self, mac: &str, name: &str, device_type: &str) {
        if mac.is_empty() {
            return;
        }
        self.names.insert(mac.to_string(), name.to_string());
        self.device_types
            .insert(mac.to_string(), device_type.to_string());
    }

    pub fn record_type(&mut self, mac: &str, device_type: &str) {
        if mac.is_empty() {
            return;
        }
        self.device_types
            .insert(mac.to_string(), device_type.to_string());
    }

    pub fn name_of(&self, mac: &str) -> &str {
        self.names.get(mac).map(String::as_str).unwrap_or(UNKNOWN_NAME)
    }

    pub fn known_name_of(&self, mac: &str) -> Option<&str> {
        self.names.get(mac).map(String::as_str)
    }

    pub fn type_of(&self, mac: &str) -> Option<&str> {
        self.device_types.get(mac).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Operator-demand reset.
    pub fn clear(&mut self) {
        self.names.clear();
        self.device_types.clear();
    }

    /// Wire form of a registry update for the Core↔Enroller back-channel.
    pub fn format_record(mac: &str, name: &str, device_type: &str) -> String {
        format!("HOSTP2PD_ADD_REGISTER\t{mac}\t{name}\t{device_type}")
    }

    /// Apply a tab-separated `HOSTP2PD_ADD_REGISTER` record; silently
    /// ignores malformed ones.
    pub fn apply_record(&mut self, line: &str) {
        let mut fields = line.split('\t');
        let _tag = fields.next();
        match (fields.next(), fields.next(), fields.next()) {
            (Some(mac), Some(name), Some(device_type))
                if !mac.is_empty() && !name.is_empty() && !device_type.is_empty() =>
            {
                self.record(mac, name, device_type);
            }
            _ => {}
        }
    }
}

/// Open-ended per-tag counters plus the last response seen.
#[derive(Debug, Default)]
pub struct Statistics {
    counters: HashMap<String, u64>,
    last_response_message: Option<String>,
    n_stations: Option<u32>,
}

impl Statistics {
    /// Account one response message under its tag.
    pub fn register(&mut self, tag: &str) {
        self.last_response_message = Some(tag.to_string());
        self.bump("response_messages");
        self.bump(tag);
    }

    pub fn bump(&mut self, key: &str) {
        *self.counters.entry(key.to_string()).or_insert(0) += 1;
    }

    pub fn count(&self, key: &str) -> u64 {
        self.counters.get(key).copied().unwrap_or(0)
    }

    pub fn last_response_message(&self) -> Option<&str> {
        self.last_response_message.as_deref()
    }

    pub fn set_stations(&mut self, n: u32) {
        self.n_stations = Some(n);
    }

    pub fn stations(&self) -> Option<u32> {
        self.n_stations
    }

    pub fn clear(&mut self) {
        self.counters.clear();
        self.last_response_message = None;
        self.n_stations = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_falls_back_to_unknown() {
        let registry = AddressRegistry::default();
        assert_eq!(registry.name_of("aa:bb:cc:dd:ee:ff"), UNKNOWN_NAME);
        assert_eq!(registry.known_name_of("aa:bb:cc:dd:ee:ff"), None);
    }

    #[test]
    fn record_application_is_idempotent() {
        let mut registry = AddressRegistry::default();
        let record = AddressRegistry::format_record(
            "ee:54:44:24:70:df",
            "testphone",
            "Dual-band Smartphone",
        );
        registry.apply_record(&record);
        let once_names = registry.len();
        registry.apply_record(&record);
        registry.apply_record(&record);
        assert_eq!(registry.len(), once_names);
        assert_eq!(registry.name_of("ee:54:44:24:70:df"), "testphone");
        assert_eq!(
            registry.type_of("ee:54:44:24:70:df"),
            Some("Dual-band Smartphone")
        );
    }

    #[test]
    fn malformed_record_is_ignored() {
        let mut registry = AddressRegistry::default();
        registry.apply_record("HOSTP2PD_ADD_REGISTER\taa:bb");
        registry.apply_record("HOSTP2PD_ADD_REGISTER\t\t\t");
        assert!(registry.is_empty());
    }

    #[test]
    fn later_record_overwrites_name() {
        let mut registry = AddressRegistry::default();
        registry.record("aa:bb:cc:dd:ee:ff", "old", "Notebook");
        registry.record("aa:bb:cc:dd:ee:ff", "new", "Notebook");
        assert_eq!(registry.name_of("aa:bb:cc:dd:ee:ff"), "new");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn statistics_track_tags_and_last_message() {
        let mut stats = Statistics::default();
        stats.register("P2P-DEVICE-FOUND");
        stats.register("P2P-DEVICE-FOUND");
        stats.register("OK");
        assert_eq!(stats.count("P2P-DEVICE-FOUND"), 2);
        assert_eq!(stats.count("response_messages"), 3);
        assert_eq!(stats.last_response_message(), Some("OK"));
    }
}
