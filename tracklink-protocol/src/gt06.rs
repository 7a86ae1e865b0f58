//! GT06 family codec (Concox and compatible terminals).
//!
//! Decoding is split in two steps: [`RawFrame::parse`] validates the
//! skeleton and checksum, then the information content is interpreted by the
//! decoder for its type code.
//!
//! Coordinate sign convention: the wire carries unsigned magnitudes. Latitude
//! is north when bit 10 of the course/status word is set and south otherwise;
//! longitude is west when bit 11 is set and east otherwise.

use crate::codec::{AckChecksum, AckKind, Decoded, FrameCodec};
use crate::error::ProtocolError;
use crate::frame::{FrameBuilder, RawFrame, MAGIC};
use crate::message::{
    alarm_name, AlarmReport, CellTower, DecodedMessage, LocationFix, LoginInfo, MessageKind,
    Payload, StatusReport, TerminalInfo,
};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{Datelike, NaiveDate, TimeZone, Timelike, Utc};

/// Registry name of the protocol.
pub const PROTOCOL_NAME: &str = "gt06";

/// Message type codes.
pub mod types {
    pub const LOGIN: u8 = 0x01;
    pub const LOCATION: u8 = 0x12;
    pub const HEARTBEAT: u8 = 0x13;
    pub const STATUS: u8 = 0x14;
    pub const ALARM: u8 = 0x16;
    pub const LBS: u8 = 0x17;
    pub const ALARM_EXT: u8 = 0x18;
    pub const EXTENDED: u8 = 0x19;
    pub const LOCATION_4G: u8 = 0x22;
    pub const STATUS_EXT: u8 = 0x26;
    /// Outbound only: negative login acknowledgment.
    pub const LOGIN_REJECT: u8 = 0x81;
}

/// Raw coordinate units per degree (30000 per minute).
pub const COORDINATE_SCALE: f64 = 30000.0 * 60.0;

/// Bytes of the GPS block: date/time, length/satellites, lat, lon, speed, course.
pub const GPS_BLOCK_LEN: usize = 18;

/// Minimum LOCATION information: GPS block plus MCC and MNC.
pub const LOCATION_MIN_INFO: usize = GPS_BLOCK_LEN + 3;

/// Identity bytes at the start of a LOGIN body.
pub const DEVICE_ID_LEN: usize = 8;

const COURSE_MASK: u16 = 0x03FF;
const NORTH_BIT: u16 = 1 << 10;
const WEST_BIT: u16 = 1 << 11;
const POSITIONED_BIT: u16 = 1 << 12;

/// Codec for `0x78 0x78` framed terminals.
#[derive(Debug, Clone, Default)]
pub struct Gt06Codec {
    ack_checksum: AckChecksum,
}

impl Gt06Codec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how acknowledgment checksums are written.
    pub fn with_ack_checksum(mut self, ack_checksum: AckChecksum) -> Self {
        self.ack_checksum = ack_checksum;
        self
    }

    pub fn ack_checksum(&self) -> AckChecksum {
        self.ack_checksum
    }
}

impl FrameCodec for Gt06Codec {
    fn name(&self) -> &str {
        PROTOCOL_NAME
    }

    fn marker(&self) -> &[u8] {
        &MAGIC
    }

    fn decode(&self, buf: &[u8]) -> Result<Option<Decoded>, ProtocolError> {
        let Some((frame, consumed)) = RawFrame::parse(buf)? else {
            return Ok(None);
        };

        let payload = decode_payload(&frame, consumed)?;
        let message = DecodedMessage {
            kind: payload.kind(),
            device_id: None,
            timestamp: Utc::now(),
            protocol: PROTOCOL_NAME.to_string(),
            type_code: frame.type_code,
            serial: frame.serial,
            payload,
            raw: Bytes::copy_from_slice(&buf[..consumed]),
        };

        Ok(Some(Decoded { message, consumed }))
    }

    fn encode_ack(&self, kind: AckKind, serial: u16) -> Option<BytesMut> {
        Some(encode_ack(kind, serial, self.ack_checksum))
    }
}

/// Builds a 10-byte acknowledgment frame.
pub fn encode_ack(kind: AckKind, serial: u16, checksum: AckChecksum) -> BytesMut {
    let type_code = match kind {
        AckKind::LoginAccepted => types::LOGIN,
        AckKind::LoginRejected => types::LOGIN_REJECT,
        AckKind::Heartbeat => types::HEARTBEAT,
        AckKind::Location => types::LOCATION,
    };

    let mut buf = BytesMut::with_capacity(10);
    buf.put_slice(&MAGIC);
    buf.put_u8(0x05);
    buf.put_u8(type_code);
    buf.put_u16(serial);
    let crc = match checksum {
        AckChecksum::Computed => crate::crc::crc16_x25(&buf[2..]),
        AckChecksum::Zeroed => 0,
    };
    buf.put_u16(crc);
    buf.put_slice(&crate::frame::STOP);
    buf
}

/// Maps a GT06 protocol number to the message kind it decodes to.
///
/// LBS-only (`0x17`) and extended (`0x19`) frames carry no GPS fix and map
/// to `Unknown`.
pub fn message_kind(type_code: u8) -> MessageKind {
    match type_code {
        types::LOGIN => MessageKind::Login,
        types::LOCATION | types::LOCATION_4G => MessageKind::Location,
        types::ALARM | types::ALARM_EXT => MessageKind::Alarm,
        types::HEARTBEAT => MessageKind::Heartbeat,
        types::STATUS | types::STATUS_EXT => MessageKind::Status,
        _ => MessageKind::Unknown,
    }
}

fn decode_payload(frame: &RawFrame, frame_len: usize) -> Result<Payload, ProtocolError> {
    let info = frame.info.as_ref();
    match message_kind(frame.type_code) {
        MessageKind::Login => decode_login(info, frame_len).map(Payload::Login),
        MessageKind::Location => decode_location(info, frame_len).map(Payload::Location),
        MessageKind::Alarm => decode_alarm(info, frame_len).map(Payload::Alarm),
        MessageKind::Heartbeat => decode_status(info, frame_len).map(Payload::Heartbeat),
        MessageKind::Status => decode_status(info, frame_len).map(Payload::Status),
        MessageKind::Unknown => Ok(Payload::Unknown {
            body: frame.info.clone(),
        }),
    }
}

fn field_error(field: &'static str, reason: impl Into<String>, frame_len: usize) -> ProtocolError {
    ProtocolError::InvalidField {
        field,
        reason: reason.into(),
        frame_len,
    }
}

fn require(info: &[u8], min: usize, field: &'static str, frame_len: usize) -> Result<(), ProtocolError> {
    if info.len() < min {
        return Err(field_error(
            field,
            format!("body is {} bytes, need at least {}", info.len(), min),
            frame_len,
        ));
    }
    Ok(())
}

fn decode_login(info: &[u8], frame_len: usize) -> Result<LoginInfo, ProtocolError> {
    require(info, DEVICE_ID_LEN, "device_id", frame_len)?;
    let device_id = hex::encode(&info[..DEVICE_ID_LEN]);
    let model_code = info
        .get(DEVICE_ID_LEN..DEVICE_ID_LEN + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]));
    Ok(LoginInfo {
        device_id,
        model_code,
    })
}

/// Decodes the 18-byte GPS block at the start of `info`.
fn decode_gps(info: &[u8], frame_len: usize) -> Result<LocationFix, ProtocolError> {
    require(info, GPS_BLOCK_LEN, "gps", frame_len)?;

    // Terminals without a GPS time yet send zeroed or out-of-range date bytes.
    let fix_time = NaiveDate::from_ymd_opt(2000 + info[0] as i32, info[1] as u32, info[2] as u32)
        .and_then(|d| d.and_hms_opt(info[3] as u32, info[4] as u32, info[5] as u32))
        .map(|naive| Utc.from_utc_datetime(&naive));

    let gps_info_len = info[6] >> 4;
    let satellites = info[6] & 0x0F;
    let raw_lat = u32::from_be_bytes([info[7], info[8], info[9], info[10]]);
    let raw_lon = u32::from_be_bytes([info[11], info[12], info[13], info[14]]);
    let speed_kmh = info[15];
    let course = u16::from_be_bytes([info[16], info[17]]);

    let mut latitude = raw_lat as f64 / COORDINATE_SCALE;
    let mut longitude = raw_lon as f64 / COORDINATE_SCALE;
    if course & NORTH_BIT == 0 {
        latitude = -latitude;
    }
    if course & WEST_BIT != 0 {
        longitude = -longitude;
    }

    Ok(LocationFix {
        fix_time,
        gps_info_len,
        satellites,
        latitude,
        longitude,
        speed_kmh,
        heading: course & COURSE_MASK,
        positioned: course & POSITIONED_BIT != 0,
        valid: gps_info_len != 0 && fix_time.is_some(),
        cell: None,
    })
}

/// Reads MCC/MNC and, when present, LAC and the 3-byte cell id.
fn decode_cell(block: &[u8]) -> Option<CellTower> {
    if block.len() < 3 {
        return None;
    }
    let mcc = u16::from_be_bytes([block[0], block[1]]);
    let mnc = block[2];
    let lac = block.get(3..5).map(|b| u16::from_be_bytes([b[0], b[1]]));
    let cell_id = block
        .get(5..8)
        .map(|b| u32::from_be_bytes([0, b[0], b[1], b[2]]));
    Some(CellTower {
        mcc,
        mnc,
        lac,
        cell_id,
    })
}

fn decode_location(info: &[u8], frame_len: usize) -> Result<LocationFix, ProtocolError> {
    require(info, LOCATION_MIN_INFO, "location", frame_len)?;
    let mut fix = decode_gps(info, frame_len)?;
    fix.cell = decode_cell(&info[GPS_BLOCK_LEN..]);
    Ok(fix)
}

/// Alarm bodies carry an LBS length byte between the GPS and cell blocks,
/// followed by terminal info, voltage, GSM signal, alarm code and language.
fn decode_alarm(info: &[u8], frame_len: usize) -> Result<AlarmReport, ProtocolError> {
    let mut fix = decode_gps(info, frame_len)?;
    let rest = &info[GPS_BLOCK_LEN..];

    let Some((&lbs_len, rest)) = rest.split_first() else {
        return Ok(AlarmReport {
            fix,
            alarm_code: None,
            alarm: None,
            terminal: None,
        });
    };

    let lbs_len = (lbs_len as usize).min(rest.len());
    fix.cell = decode_cell(&rest[..lbs_len]);
    let status = &rest[lbs_len..];

    let terminal = status.first().map(|&b| TerminalInfo::from_byte(b));
    let alarm_code = status.get(3).copied();
    Ok(AlarmReport {
        fix,
        alarm_code,
        alarm: alarm_code.and_then(alarm_name),
        terminal,
    })
}

fn decode_status(info: &[u8], frame_len: usize) -> Result<StatusReport, ProtocolError> {
    require(info, 1, "terminal_info", frame_len)?;
    Ok(StatusReport {
        terminal: TerminalInfo::from_byte(info[0]),
        voltage_level: info.get(1).copied(),
        gsm_signal: info.get(2).copied(),
        alarm_code: info.get(3).copied(),
        language: info.get(4).copied(),
    })
}

/// Encodes a LOGIN information block for `device_id` (16 hex characters).
pub fn encode_login_info(device_id: &str, model_code: Option<u16>) -> Result<Vec<u8>, ProtocolError> {
    let id = hex::decode(device_id)
        .ok()
        .filter(|bytes| bytes.len() == DEVICE_ID_LEN)
        .ok_or_else(|| ProtocolError::InvalidDeviceId(device_id.to_string()))?;

    let mut info = Vec::with_capacity(DEVICE_ID_LEN + 2);
    info.extend_from_slice(&id);
    if let Some(model) = model_code {
        info.extend_from_slice(&model.to_be_bytes());
    }
    Ok(info)
}

fn encode_gps(fix: &LocationFix, out: &mut Vec<u8>) {
    match fix.fix_time {
        Some(t) => {
            out.push((t.year() - 2000).clamp(0, 255) as u8);
            out.push(t.month() as u8);
            out.push(t.day() as u8);
            out.push(t.hour() as u8);
            out.push(t.minute() as u8);
            out.push(t.second() as u8);
        }
        None => out.extend_from_slice(&[0; 6]),
    }
    out.push((fix.gps_info_len << 4) | (fix.satellites & 0x0F));

    let raw_lat = (fix.latitude.abs() * COORDINATE_SCALE).round() as u32;
    let raw_lon = (fix.longitude.abs() * COORDINATE_SCALE).round() as u32;
    out.extend_from_slice(&raw_lat.to_be_bytes());
    out.extend_from_slice(&raw_lon.to_be_bytes());
    out.push(fix.speed_kmh);

    let mut course = fix.heading & COURSE_MASK;
    if fix.latitude >= 0.0 {
        course |= NORTH_BIT;
    }
    if fix.longitude < 0.0 {
        course |= WEST_BIT;
    }
    if fix.positioned {
        course |= POSITIONED_BIT;
    }
    out.extend_from_slice(&course.to_be_bytes());
}

fn encode_cell(cell: Option<&CellTower>, out: &mut Vec<u8>) {
    let cell = cell.copied().unwrap_or(CellTower {
        mcc: 0,
        mnc: 0,
        lac: Some(0),
        cell_id: Some(0),
    });
    out.extend_from_slice(&cell.mcc.to_be_bytes());
    out.push(cell.mnc);
    if let Some(lac) = cell.lac {
        out.extend_from_slice(&lac.to_be_bytes());
        if let Some(cell_id) = cell.cell_id {
            out.extend_from_slice(&cell_id.to_be_bytes()[1..]);
        }
    }
}

/// Encodes a LOCATION information block.
pub fn encode_location_info(fix: &LocationFix) -> Vec<u8> {
    let mut info = Vec::with_capacity(LOCATION_MIN_INFO + 5);
    encode_gps(fix, &mut info);
    encode_cell(fix.cell.as_ref(), &mut info);
    info
}

/// Encodes an ALARM information block.
pub fn encode_alarm_info(report: &AlarmReport) -> Vec<u8> {
    let mut info = Vec::with_capacity(GPS_BLOCK_LEN + 14);
    encode_gps(&report.fix, &mut info);

    let mut cell = Vec::with_capacity(8);
    encode_cell(report.fix.cell.as_ref(), &mut cell);
    info.push(cell.len() as u8);
    info.extend_from_slice(&cell);

    info.push(report.terminal.map(|t| t.raw).unwrap_or(0));
    info.push(0x04); // voltage level
    info.push(0x04); // gsm signal
    info.push(report.alarm_code.unwrap_or(0));
    info.push(0x02); // language: english
    info
}

/// Encodes a HEARTBEAT or STATUS information block.
pub fn encode_status_info(report: &StatusReport) -> Vec<u8> {
    let mut info = vec![report.terminal.raw];
    let optional = [
        report.voltage_level,
        report.gsm_signal,
        report.alarm_code,
        report.language,
    ];
    for value in optional.into_iter().map_while(|v| v) {
        info.push(value);
    }
    info
}

/// Builds a complete device-side frame.
pub fn encode_frame(type_code: u8, info: &[u8], serial: u16) -> Result<BytesMut, ProtocolError> {
    FrameBuilder::new(type_code).info(info).serial(serial).encode()
}
