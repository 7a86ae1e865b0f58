//! Command execution.

use chrono::Utc;
use colored::Colorize;
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tracklink_client::{Terminal, TerminalConfig};
use tracklink_protocol::gt06;
use tracklink_protocol::{
    AckChecksum, AckKind, AlarmReport, Detection, Gt06Codec, LocationFix, ProtocolRegistry,
    StatusReport, TerminalInfo,
};

type CommandResult = Result<String, Box<dyn std::error::Error>>;

/// Decodes every frame in a hex dump and renders them as JSON.
pub fn decode(input: &str) -> CommandResult {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(cleaned)?;
    if bytes.is_empty() {
        return Err("no bytes to decode".into());
    }

    let protocols = ProtocolRegistry::with_defaults(Gt06Codec::new());
    let codec = match protocols.identify(&bytes) {
        Detection::Match(name) => protocols
            .get(&name)
            .ok_or_else(|| format!("protocol '{}' is not registered", name))?,
        Detection::NeedMore => return Err("too few bytes to detect the protocol".into()),
        Detection::NoMatch => {
            let prefix = hex::encode(&bytes[..bytes.len().min(8)]);
            return Err(format!("no protocol matches prefix {}", prefix).into());
        }
    };

    let mut messages = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        match codec.decode(&bytes[offset..]) {
            Ok(Some(decoded)) => {
                messages.push(serde_json::to_value(&decoded.message)?);
                offset += decoded.consumed;
            }
            Ok(None) => {
                return Err(format!(
                    "incomplete frame at offset {} ({} bytes left)",
                    offset,
                    bytes.len() - offset
                )
                .into())
            }
            Err(e) => return Err(format!("frame at offset {}: {}", offset, e).into()),
        }
    }

    let output = if messages.len() == 1 {
        messages.remove(0)
    } else {
        Value::Array(messages)
    };
    Ok(serde_json::to_string_pretty(&output)?)
}

/// Renders an acknowledgment frame as hex.
pub fn ack(kind: AckKind, serial: u16, zeroed: bool) -> String {
    let checksum = if zeroed {
        AckChecksum::Zeroed
    } else {
        AckChecksum::Computed
    };
    hex::encode(gt06::encode_ack(kind, serial, checksum))
}

/// What a simulated terminal sends.
#[derive(Debug, Clone)]
pub struct SimulationPlan {
    pub server: SocketAddr,
    pub device_id: String,
    pub count: u32,
    pub interval: Duration,
    /// Latitude and longitude of the first fix.
    pub start: (f64, f64),
    pub alarm: bool,
}

/// Fix number `step` of a simulated drive heading north-east.
pub fn simulated_fix(start: (f64, f64), step: u32) -> LocationFix {
    let offset = step as f64 * 0.0005;
    LocationFix {
        fix_time: Some(Utc::now()),
        gps_info_len: 12,
        satellites: 9,
        latitude: (start.0 + offset).clamp(-90.0, 90.0),
        longitude: (start.1 + offset).clamp(-180.0, 180.0),
        speed_kmh: 40,
        heading: 45,
        positioned: true,
        valid: true,
        cell: None,
    }
}

fn idle_status() -> StatusReport {
    StatusReport {
        terminal: TerminalInfo::from_byte(0x46),
        voltage_level: Some(4),
        gsm_signal: Some(4),
        alarm_code: Some(0),
        language: Some(2),
    }
}

/// Connects, logs in and sends the planned traffic.
pub async fn simulate(plan: SimulationPlan) -> CommandResult {
    tracing::debug!("Simulating {} fixes against {}", plan.count, plan.server);
    let config = TerminalConfig::new(plan.server, plan.device_id.clone());
    let mut terminal = Terminal::connect(config).await?;

    let ack = terminal.login().await?;
    eprintln!(
        "{} as {} (serial {})",
        "Logged in".green(),
        plan.device_id.cyan(),
        ack.serial
    );

    terminal.heartbeat(&idle_status()).await?;

    let mut sent = 0;
    for step in 0..plan.count {
        if step > 0 {
            tokio::time::sleep(plan.interval).await;
        }
        let fix = simulated_fix(plan.start, step);
        let ack = terminal.send_location(&fix).await?;
        sent += 1;
        eprintln!(
            "{} {:.5},{:.5} (serial {})",
            "Location".green(),
            fix.latitude,
            fix.longitude,
            ack.serial
        );
    }

    if plan.alarm {
        let report = AlarmReport {
            fix: simulated_fix(plan.start, plan.count),
            alarm_code: Some(0x01),
            alarm: Some("sos"),
            terminal: Some(TerminalInfo::from_byte(0x46)),
        };
        let ack = terminal.send_alarm(&report).await?;
        eprintln!("{} sos (serial {})", "Alarm".red(), ack.serial);
    }

    terminal.close().await?;
    Ok(format!(
        "{} {} locations{} for {}",
        "Sent".green(),
        sent,
        if plan.alarm { " and 1 alarm" } else { "" },
        plan.device_id.cyan()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGIN_HEX: &str = "78780d010123456789abcdef00014cd40d0a";
    const HEARTBEAT_HEX: &str = "78780a1344040400020001b5820d0a";

    #[test]
    fn test_decode_login() {
        let output = decode(LOGIN_HEX).unwrap();
        let json: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(json["kind"], "LOGIN");
        assert_eq!(json["payload"]["device_id"], "0123456789abcdef");
        assert_eq!(json["serial"], 1);
        assert_eq!(json["raw"], LOGIN_HEX);
    }

    #[test]
    fn test_decode_multiple_frames_with_spaces() {
        let input = format!("{} {}", LOGIN_HEX, HEARTBEAT_HEX);
        let json: Value = serde_json::from_str(&decode(&input).unwrap()).unwrap();
        let frames = json.as_array().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1]["kind"], "HEARTBEAT");
    }

    #[test]
    fn test_decode_errors() {
        assert!(decode("zz").is_err());
        assert!(decode("").is_err());
        assert!(decode(&LOGIN_HEX[..20]).is_err());
        assert!(decode("2a48512c").is_err());
        assert!(decode("474554202f20").is_err());
    }

    #[test]
    fn test_ack_hex() {
        assert_eq!(ack(AckKind::LoginAccepted, 1, false), "787805010001d9dc0d0a");
        assert_eq!(ack(AckKind::Heartbeat, 2, true), "78780513000200000d0a");
    }

    #[test]
    fn test_simulated_fix_moves() {
        let first = simulated_fix((22.5, 114.0), 0);
        let later = simulated_fix((22.5, 114.0), 10);
        assert_eq!(first.latitude, 22.5);
        assert!(later.latitude > first.latitude);
        assert!(later.in_bounds());

        let edge = simulated_fix((90.0, 180.0), 5);
        assert!(edge.in_bounds());
    }
}
