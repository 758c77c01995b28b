//! Control-client line parsing.
//!
//! Each line received from the control client is decomposed into a tagged
//! event with the well-known attributes the state machine dispatches on.
//! Attribute probes are fixed regular expressions and idempotent: a missing
//! attribute simply stays empty.

use std::sync::LazyLock;

use regex::Regex;

static PRIORITY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^<[0-9]*>").unwrap());
static NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"name='([^']*)'").unwrap());
static P2P_DEV_ADDR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"p2p_dev_addr=([^ ]+)").unwrap());
static SA_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"sa=([^ ]+)").unwrap());
static PRI_DEV_TYPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"pri_dev_type=([^ ]+)").unwrap());
static DEV_PASSWD_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"dev_passwd_id=([^ ]+)").unwrap());
static GO_INTENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"go_intent=([^ ]+)").unwrap());
static SSID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"ssid="([^"]*)""#).unwrap());
static PERSISTENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"persistent=([0-9]+)").unwrap());
static MAC_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:> )?(?:[0-9a-f]{2}(?::[0-9a-f]{2}){5}|[0-9a-f]{2}(?:-[0-9a-f]{2}){5}|[0-9a-f]{12})$",
    )
    .unwrap()
});

/// One parsed control-client line.
#[derive(Debug, Clone)]
pub struct ControlEvent {
    /// Full line with the echo prompt stripped.
    pub raw: String,
    /// First token, stripped of the `<N>` priority tag.
    pub tag: String,
    /// Whitespace tokens after prompt removal; `words[0]` still carries
    /// the priority tag.
    pub words: Vec<String>,
    /// Second token, by convention a MAC address for most events.
    pub mac: Option<String>,
    pub name: Option<String>,
    pub p2p_dev_addr: Option<String>,
    pub sa: Option<String>,
    pub pri_dev_type: Option<String>,
    pub dev_passwd_id: Option<String>,
    pub go_intent: Option<String>,
    pub ssid: Option<String>,
    pub persistent: Option<u32>,
}

impl ControlEvent {
    /// Parse one received line. Returns `None` for empty or prompt-only
    /// lines, which carry no event.
    pub fn parse(line: &str) -> Option<ControlEvent> {
        let mut words: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        if words.first().map(String::as_str) == Some(">") {
            words.remove(0);
        }
        let first = words.first()?;
        let tag = PRIORITY_RE.replace(first, "").into_owned();
        if tag.is_empty() {
            return None;
        }

        let capture = |re: &Regex| re.captures(line).map(|c| c[1].to_string());
        Some(ControlEvent {
            raw: line.trim_start_matches("> ").to_string(),
            mac: words.get(1).cloned(),
            name: capture(&NAME_RE),
            p2p_dev_addr: capture(&P2P_DEV_ADDR_RE),
            sa: capture(&SA_RE),
            pri_dev_type: capture(&PRI_DEV_TYPE_RE),
            dev_passwd_id: capture(&DEV_PASSWD_ID_RE),
            go_intent: capture(&GO_INTENT_RE),
            ssid: capture(&SSID_RE),
            persistent: PERSISTENT_RE
                .captures(line)
                .and_then(|c| c[1].parse().ok()),
            tag,
            words,
        })
    }

    pub fn word(&self, index: usize) -> Option<&str> {
        self.words.get(index).map(String::as_str)
    }

    /// Device-type label from the `pri_dev_type` attribute.
    pub fn device_type(&self) -> &'static str {
        self.pri_dev_type
            .as_deref()
            .map(device_type_label)
            .unwrap_or(GENERIC_DEVICE)
    }

    pub fn password_id(&self) -> PasswordId {
        match &self.dev_passwd_id {
            Some(id) => PasswordId::from_attr(id),
            None => PasswordId::Unknown,
        }
    }

    /// Fields of a `WPS-ENROLLEE-SEEN mac uuid type flags … [name]` line:
    /// `(mac, device-type label, friendly name)`.
    pub fn enrollee_seen(&self) -> Option<(&str, &'static str, String)> {
        if self.tag != "WPS-ENROLLEE-SEEN" {
            return None;
        }
        let mac = self.mac.as_deref()?;
        let label = self
            .word(3)
            .map(device_type_label)
            .unwrap_or(GENERIC_DEVICE);
        let name = self.words.get(7..).unwrap_or_default().join(" ");
        let name = name
            .strip_prefix('[')
            .and_then(|n| n.strip_suffix(']'))
            .unwrap_or(&name)
            .to_string();
        Some((mac, label, name))
    }
}

/// A line consisting of nothing but a MAC address (a `list_sta` row).
pub fn is_mac_line(line: &str) -> bool {
    MAC_LINE_RE.is_match(&line.to_lowercase())
}

/// Control-client startup sentinels that trigger the activation sequence.
pub fn is_activation_sentinel(line: &str) -> bool {
    line == "Interactive mode"
        || line.contains("Connection established")
        || line.contains("Connection to wpa_supplicant re-established")
}

/// Transient connection failures of the control client, counted against
/// `max_num_wpa_cli_failures`.
pub fn is_client_error(line: &str) -> bool {
    line.contains("Could not connect to wpa_supplicant")
        || line.contains("Connection to wpa_supplicant lost")
        || line.contains("Not connected to wpa_supplicant")
}

/// The supplicant refused a scan trigger because one is already pending.
pub fn is_scan_reject(line: &str) -> bool {
    line.contains("P2P: Reject scan trigger since one is already pending")
}

pub const GENERIC_DEVICE: &str = "generic device";

/// Primary device type labels from the Wi-Fi P2P Technical Specification,
/// Annex B Table B1, with the Wi-Fi Alliance OUI 00 50 F2 04.
pub fn device_type_label(code: &str) -> &'static str {
    match code {
        "1-0050F204-1" => "Computer PC",
        "1-0050F204-2" => "Computer Server",
        "1-0050F204-3" => "Media Center",
        "1-0050F204-4" => "Ultra-mobile PC",
        "1-0050F204-5" => "Notebook",
        "1-0050F204-6" => "Desktop",
        "1-0050F204-7" => "MID (Mobile Internet Device)",
        "1-0050F204-8" => "Netbook",
        "1-0050F204-9" => "Tablet",
        "2-0050F204-1" => "Keyboard",
        "2-0050F204-2" => "Mouse device",
        "2-0050F204-3" => "Joystick device",
        "2-0050F204-4" => "Trackball device",
        "2-0050F204-5" => "Gaming controller",
        "2-0050F204-6" => "Remote device",
        "2-0050F204-7" => "Touchscreen device",
        "2-0050F204-8" => "Biometric reader",
        "2-0050F204-9" => "Barcode reader",
        "3-0050F204-1" => "Printer",
        "3-0050F204-2" => "Scanner",
        "3-0050F204-3" => "Fax",
        "3-0050F204-4" => "Copier",
        "3-0050F204-5" => "All-in-one Printer",
        "4-0050F204-1" => "Digital Still Camera",
        "4-0050F204-2" => "Video Camera",
        "4-0050F204-3" => "Web Camera",
        "4-0050F204-4" => "Security Camera",
        "5-0050F204-1" => "NAS storage device",
        "6-0050F204-1" => "AP Network Infrastructure device",
        "6-0050F204-2" => "Router device",
        "6-0050F204-3" => "Switch device",
        "6-0050F204-4" => "Gateway device",
        "7-0050F204-1" => "Television device",
        "7-0050F204-2" => "Electronic Picture Frame device",
        "7-0050F204-3" => "Projector device",
        "7-0050F204-4" => "Monitor device",
        "8-0050F204-1" => "DAR device",
        "8-0050F204-2" => "PVR device",
        "8-0050F204-3" => "MCX device",
        "8-0050F204-4" => "Set-top box",
        "8-0050F204-5" => "Media Server/Media Adapter/Media Extender",
        "8-0050F204-6" => "Portable Video Player",
        "9-0050F204-1" => "Xbox",
        "9-0050F204-2" => "Xbox360",
        "9-0050F204-3" => "Playstation",
        "9-0050F204-4" => "Game Console/Game Console Adapter",
        "9-0050F204-5" => "Portable Gaming Device",
        "10-0050F204-1" => "Windows Mobile",
        "10-0050F204-2" => "Phone - single mode",
        "10-0050F204-3" => "Phone - dual mode",
        "10-0050F204-4" => "Smartphone - single mode",
        "10-0050F204-5" => "Dual-band Smartphone",
        "11-0050F204-1" => "Audio tuner/receiver",
        "11-0050F204-2" => "Speakers",
        "11-0050F204-3" => "Portable Music Player (PMP)",
        "11-0050F204-4" => "Headset (headphones + microphone)",
        "11-0050F204-5" => "Headphones",
        "11-0050F204-6" => "Microphone",
        _ => GENERIC_DEVICE,
    }
}

/// WSC Device Password ID (Wi-Fi Simple Configuration spec, Table 37).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordId {
    DefaultPin,
    UserSpecified,
    MachineSpecified,
    Rekey,
    PushButton,
    RegistrarSpecified,
    NfcHandover,
    P2ps,
    Reserved,
    /// Out-of-band value above 0x000F.
    Random,
    Unknown,
}

impl PasswordId {
    pub fn from_attr(attr: &str) -> PasswordId {
        let Ok(id) = attr.parse::<u32>() else {
            return PasswordId::Unknown;
        };
        match id {
            0 => PasswordId::DefaultPin,
            1 => PasswordId::UserSpecified,
            2 => PasswordId::MachineSpecified,
            3 => PasswordId::Rekey,
            4 => PasswordId::PushButton,
            5 => PasswordId::RegistrarSpecified,
            7 => PasswordId::NfcHandover,
            8 => PasswordId::P2ps,
            6 | 9..=15 => PasswordId::Reserved,
            _ => PasswordId::Random,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PasswordId::DefaultPin => "Default (PIN)",
            PasswordId::UserSpecified => "User-specified",
            PasswordId::MachineSpecified => "Machine-specified",
            PasswordId::Rekey => "Rekey",
            PasswordId::PushButton => "PushButton",
            PasswordId::RegistrarSpecified => "Registrar-specified",
            PasswordId::NfcHandover => "NFC-Connection-Handover",
            PasswordId::P2ps => "P2Ps",
            PasswordId::Reserved => "Reserved",
            PasswordId::Random => "Random",
            PasswordId::Unknown => "Unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_found() {
        let event = ControlEvent::parse(
            "<3>P2P-DEVICE-FOUND ae:e2:d3:41:27:14 p2p_dev_addr=ae:e2:d3:41:a7:14 \
             pri_dev_type=3-0050F204-1 name='test' config_methods=0x0 dev_capab=0x25 \
             group_capab=0x81 vendor_elems=1 new=1",
        )
        .unwrap();
        assert_eq!(event.tag, "P2P-DEVICE-FOUND");
        assert_eq!(event.mac.as_deref(), Some("ae:e2:d3:41:27:14"));
        assert_eq!(event.p2p_dev_addr.as_deref(), Some("ae:e2:d3:41:a7:14"));
        assert_eq!(event.name.as_deref(), Some("test"));
        assert_eq!(event.device_type(), "Printer");
    }

    #[test]
    fn strips_echo_prompt() {
        let event = ControlEvent::parse("> <3>P2P-FIND-STOPPED").unwrap();
        assert_eq!(event.tag, "P2P-FIND-STOPPED");
    }

    #[test]
    fn prompt_only_line_is_no_event() {
        assert!(ControlEvent::parse("> ").is_none());
        assert!(ControlEvent::parse("").is_none());
        assert!(ControlEvent::parse("   ").is_none());
    }

    #[test]
    fn missing_attributes_stay_empty() {
        let event = ControlEvent::parse("OK").unwrap();
        assert_eq!(event.tag, "OK");
        assert!(event.name.is_none());
        assert!(event.ssid.is_none());
        assert_eq!(event.password_id(), PasswordId::Unknown);
        assert_eq!(event.device_type(), GENERIC_DEVICE);
    }

    #[test]
    fn parses_go_neg_request_password_id() {
        let event =
            ControlEvent::parse("<3>P2P-GO-NEG-REQUEST ee:54:44:24:70:df dev_passwd_id=4 go_intent=6")
                .unwrap();
        assert_eq!(event.password_id(), PasswordId::PushButton);
        assert_eq!(event.go_intent.as_deref(), Some("6"));
    }

    #[test]
    fn large_password_id_collapses_to_random() {
        assert_eq!(PasswordId::from_attr("33333"), PasswordId::Random);
        assert_eq!(PasswordId::from_attr("16"), PasswordId::Random);
        assert_eq!(PasswordId::from_attr("bogus"), PasswordId::Unknown);
    }

    #[test]
    fn parses_group_started_ssid() {
        let event = ControlEvent::parse(
            "<3>P2P-GROUP-STARTED p2p-wlan0-0 GO ssid=\"DIRECT-xy\" freq=5180 \
             passphrase=\"secret\" go_dev_addr=aa:bb:cc:dd:ee:ff",
        )
        .unwrap();
        assert_eq!(event.word(1), Some("p2p-wlan0-0"));
        assert_eq!(event.ssid.as_deref(), Some("DIRECT-xy"));
    }

    #[test]
    fn parses_invitation_persistent_id() {
        let event = ControlEvent::parse(
            "<3>P2P-INVITATION-ACCEPTED sa=5a:5f:0a:96:ee:5e persistent=4 freq=5220",
        )
        .unwrap();
        assert_eq!(event.sa.as_deref(), Some("5a:5f:0a:96:ee:5e"));
        assert_eq!(event.persistent, Some(4));
    }

    #[test]
    fn enrollee_seen_extracts_bracketed_name() {
        let event = ControlEvent::parse(
            "<3>WPS-ENROLLEE-SEEN ee:54:44:24:70:df 811e2280-33d1-5ce8-97e5-6fcf1598c173 \
             10-0050F204-5 0x4388 0 1 [test phone]",
        )
        .unwrap();
        let (mac, label, name) = event.enrollee_seen().unwrap();
        assert_eq!(mac, "ee:54:44:24:70:df");
        assert_eq!(label, "Dual-band Smartphone");
        assert_eq!(name, "test phone");
    }

    #[test]
    fn mac_line_detection() {
        assert!(is_mac_line("ee:54:44:24:70:df"));
        assert!(is_mac_line("> EE:54:44:24:70:DF"));
        assert!(is_mac_line("ee54442470df"));
        assert!(!is_mac_line("p2p-wlan0-0"));
        assert!(!is_mac_line("ee:54:44:24:70"));
    }

    #[test]
    fn line_classifiers() {
        assert!(is_activation_sentinel("Interactive mode"));
        assert!(is_activation_sentinel(
            "Connection to wpa_supplicant re-established"
        ));
        assert!(!is_activation_sentinel("Interactive"));
        assert!(is_client_error("Could not connect to wpa_supplicant: \
                                 /var/run/wpa_supplicant/p2p-dev-wlan0"));
        assert!(is_scan_reject(
            "<3>P2P: Reject scan trigger since one is already pending"
        ));
    }
}
