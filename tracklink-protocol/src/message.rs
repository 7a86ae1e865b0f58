//! Decoded message types.
//!
//! Every protocol codec normalizes its frames into a [`DecodedMessage`]. The
//! payload types serialize to JSON so they can be forwarded downstream as-is.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

/// Message kinds produced by frame decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Login,
    Location,
    Heartbeat,
    Alarm,
    Status,
    Unknown,
}

impl MessageKind {
    /// Lowercase label, used for metrics and job kinds.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Login => "login",
            MessageKind::Location => "location",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Alarm => "alarm",
            MessageKind::Status => "status",
            MessageKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Login => write!(f, "LOGIN"),
            MessageKind::Location => write!(f, "LOCATION"),
            MessageKind::Heartbeat => write!(f, "HEARTBEAT"),
            MessageKind::Alarm => write!(f, "ALARM"),
            MessageKind::Status => write!(f, "STATUS"),
            MessageKind::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// A fully decoded terminal message.
#[derive(Debug, Clone, Serialize)]
pub struct DecodedMessage {
    pub kind: MessageKind,
    /// Device identity, known once the connection has logged in.
    pub device_id: Option<String>,
    /// Time the frame was decoded.
    pub timestamp: DateTime<Utc>,
    /// Name of the protocol that decoded the frame.
    pub protocol: String,
    /// Protocol-specific message type code.
    pub type_code: u8,
    /// Frame serial number.
    pub serial: u16,
    pub payload: Payload,
    /// The exact bytes consumed from the stream.
    #[serde(serialize_with = "hex_bytes")]
    pub raw: Bytes,
}

impl DecodedMessage {
    /// Returns the location fix carried by LOCATION and ALARM messages.
    pub fn location(&self) -> Option<&LocationFix> {
        match &self.payload {
            Payload::Location(fix) => Some(fix),
            Payload::Alarm(alarm) => Some(&alarm.fix),
            _ => None,
        }
    }
}

/// Kind-specific message content.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Login(LoginInfo),
    Location(LocationFix),
    Alarm(AlarmReport),
    Heartbeat(StatusReport),
    Status(StatusReport),
    Unknown {
        #[serde(serialize_with = "hex_bytes")]
        body: Bytes,
    },
}

impl Payload {
    /// Message kind this payload belongs to.
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Login(_) => MessageKind::Login,
            Payload::Location(_) => MessageKind::Location,
            Payload::Alarm(_) => MessageKind::Alarm,
            Payload::Heartbeat(_) => MessageKind::Heartbeat,
            Payload::Status(_) => MessageKind::Status,
            Payload::Unknown { .. } => MessageKind::Unknown,
        }
    }
}

/// LOGIN content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginInfo {
    /// Hardware identity as 16 lowercase hex characters.
    pub device_id: String,
    /// Terminal model code, when the terminal sends one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_code: Option<u16>,
}

/// A satellite position with optional cell tower data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationFix {
    /// Device-reported time of the fix (UTC); absent when the date bytes are not a calendar date.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix_time: Option<DateTime<Utc>>,
    /// Length of the GPS information block as reported by the terminal.
    pub gps_info_len: u8,
    pub satellites: u8,
    /// Signed decimal degrees; negative is south.
    pub latitude: f64,
    /// Signed decimal degrees; negative is west.
    pub longitude: f64,
    pub speed_kmh: u8,
    /// Course over ground in degrees (0..1023 on the wire).
    pub heading: u16,
    /// Terminal reports the GPS as positioned.
    pub positioned: bool,
    /// A fix is valid only when the GPS information length is non-zero.
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cell: Option<CellTower>,
}

impl LocationFix {
    /// Returns whether the coordinates are inside the WGS84 range.
    pub fn in_bounds(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Mobile network cell the terminal is attached to (LBS data).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CellTower {
    pub mcc: u16,
    pub mnc: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lac: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cell_id: Option<u32>,
}

/// ALARM content: a location plus what raised the alarm.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmReport {
    pub fix: LocationFix,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alarm_code: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alarm: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal: Option<TerminalInfo>,
}

/// Names the alarm codes terminals commonly send.
pub fn alarm_name(code: u8) -> Option<&'static str> {
    match code {
        0x00 => Some("normal"),
        0x01 => Some("sos"),
        0x02 => Some("power_cut"),
        0x03 => Some("vibration"),
        0x04 => Some("enter_fence"),
        0x05 => Some("exit_fence"),
        0x06 => Some("over_speed"),
        0x09 => Some("displacement"),
        0x0E => Some("low_battery"),
        0x13 => Some("tamper"),
        _ => None,
    }
}

/// Terminal information byte shared by heartbeat, status and alarm bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TerminalInfo {
    pub raw: u8,
    pub defence_armed: bool,
    pub acc_on: bool,
    pub charging: bool,
    /// Alarm bits 3..=5 of the information byte.
    pub alarm_bits: u8,
    pub gps_tracking: bool,
    pub oil_electric_cut: bool,
}

impl TerminalInfo {
    pub fn from_byte(raw: u8) -> Self {
        Self {
            raw,
            defence_armed: raw & 0x01 != 0,
            acc_on: raw & 0x02 != 0,
            charging: raw & 0x04 != 0,
            alarm_bits: (raw >> 3) & 0x07,
            gps_tracking: raw & 0x40 != 0,
            oil_electric_cut: raw & 0x80 != 0,
        }
    }
}

/// HEARTBEAT and STATUS content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub terminal: TerminalInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage_level: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gsm_signal: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alarm_code: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<u8>,
}

impl StatusReport {
    /// Flattens the report into key/value fields for device metadata.
    pub fn to_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        let t = &self.terminal;
        fields.insert("defence_armed".into(), t.defence_armed.into());
        fields.insert("acc_on".into(), t.acc_on.into());
        fields.insert("charging".into(), t.charging.into());
        fields.insert("gps_tracking".into(), t.gps_tracking.into());
        fields.insert("oil_electric_cut".into(), t.oil_electric_cut.into());
        if let Some(v) = self.voltage_level {
            fields.insert("voltage_level".into(), v.into());
        }
        if let Some(v) = self.gsm_signal {
            fields.insert("gsm_signal".into(), v.into());
        }
        if let Some(code) = self.alarm_code {
            fields.insert("alarm_code".into(), code.into());
        }
        if let Some(lang) = self.language {
            fields.insert("language".into(), lang.into());
        }
        fields
    }
}

fn hex_bytes<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_fix(latitude: f64, longitude: f64) -> LocationFix {
        LocationFix {
            fix_time: Some(Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).unwrap()),
            gps_info_len: 1,
            satellites: 12,
            latitude,
            longitude,
            speed_kmh: 40,
            heading: 90,
            positioned: true,
            valid: true,
            cell: None,
        }
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(MessageKind::Login.to_string(), "LOGIN");
        assert_eq!(MessageKind::Alarm.as_str(), "alarm");
        assert_eq!(
            serde_json::to_string(&MessageKind::Heartbeat).unwrap(),
            "\"HEARTBEAT\""
        );
    }

    #[test]
    fn test_bounds() {
        assert!(sample_fix(-23.55, -46.63).in_bounds());
        assert!(sample_fix(90.0, 180.0).in_bounds());
        assert!(!sample_fix(91.0, 0.0).in_bounds());
        assert!(!sample_fix(0.0, -180.5).in_bounds());
        assert!(!sample_fix(f64::NAN, 0.0).in_bounds());
    }

    #[test]
    fn test_terminal_info_bits() {
        let info = TerminalInfo::from_byte(0b1100_0110);
        assert!(!info.defence_armed);
        assert!(info.acc_on);
        assert!(info.charging);
        assert!(info.gps_tracking);
        assert!(info.oil_electric_cut);
        assert_eq!(info.alarm_bits, 0);

        let info = TerminalInfo::from_byte(0b0010_0001);
        assert!(info.defence_armed);
        assert_eq!(info.alarm_bits, 0b100);
    }

    #[test]
    fn test_status_fields() {
        let report = StatusReport {
            terminal: TerminalInfo::from_byte(0x02),
            voltage_level: Some(4),
            gsm_signal: Some(3),
            alarm_code: None,
            language: None,
        };
        let fields = report.to_fields();
        assert_eq!(fields["acc_on"], Value::Bool(true));
        assert_eq!(fields["voltage_level"], Value::from(4));
        assert!(!fields.contains_key("alarm_code"));
    }

    #[test]
    fn test_payload_serialization() {
        let payload = Payload::Unknown {
            body: Bytes::from_static(&[0xAB, 0x01]),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "unknown");
        assert_eq!(json["body"], "ab01");

        let payload = Payload::Location(sample_fix(1.5, 2.5));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "location");
        assert_eq!(json["latitude"], 1.5);
        assert!(json.get("cell").is_none());
    }

    #[test]
    fn test_alarm_names() {
        assert_eq!(alarm_name(0x01), Some("sos"));
        assert_eq!(alarm_name(0x06), Some("over_speed"));
        assert_eq!(alarm_name(0xFF), None);
    }
}
