// src/advert.rs
//
// Decoding of vendor BLE advertisement frames. The vendor encodes its
// payload in the manufacturer-data section; a frame is recognised by the
// two-byte marker 0xFE 0xE5 followed by a device-type byte.

use std::collections::HashMap;

use serde_json::{Map, Value, json};

pub const VENDOR_MARKER: [u8; 2] = [0xFE, 0xE5];

/// Device-type byte following the marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// 0xAA: soil sensor (temperature, humidity, battery)
    Blomsterpinne,
    /// 0xBB: accelerometer button
    AccelerometerButton,
    /// 0xCC: magnetometer switch
    Magnetometer,
    Unknown(u8),
}

impl DeviceKind {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0xAA => Self::Blomsterpinne,
            0xBB => Self::AccelerometerButton,
            0xCC => Self::Magnetometer,
            other => Self::Unknown(other),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Blomsterpinne => "blomsterpinne".to_string(),
            Self::AccelerometerButton => "accelerometer-button".to_string(),
            Self::Magnetometer => "magnetometer".to_string(),
            Self::Unknown(b) => format!("unknown-0x{b:02x}"),
        }
    }
}

/// A successfully decoded vendor frame, ready to merge into a flow node.
#[derive(Debug, Clone)]
pub struct DecodedEvent {
    pub kind: DeviceKind,
    pub fields: Map<String, Value>,
}

/// Reassemble the manufacturer-data section the way it appears on air: each
/// company id as two little-endian bytes followed by its payload. Entries
/// are visited in ascending company-id order so the result is stable.
pub fn flatten_manufacturer_data(sections: &HashMap<u16, Vec<u8>>) -> Vec<u8> {
    let mut ids: Vec<u16> = sections.keys().copied().collect();
    ids.sort_unstable();
    let mut out = Vec::new();
    for id in ids {
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&sections[&id]);
    }
    out
}

/// Cheap pre-filter: does the flattened data contain the vendor marker at
/// all? Used before committing to a full decode.
pub fn matches_filter(sections: &HashMap<u16, Vec<u8>>) -> bool {
    let raw = flatten_manufacturer_data(sections);
    find_marker(&raw).is_some()
}

fn find_marker(raw: &[u8]) -> Option<usize> {
    raw.windows(2).position(|w| w == VENDOR_MARKER)
}

/// Decode a manufacturer-data section set. Returns `None` when the marker is
/// absent or the frame is truncated before the device-type byte.
pub fn decode(sections: &HashMap<u16, Vec<u8>>, rssi: Option<i16>) -> Option<DecodedEvent> {
    let raw = flatten_manufacturer_data(sections);
    let start = find_marker(&raw)?;
    decode_frame(&raw[start..], rssi)
}

/// Decode a frame starting at the vendor marker. `frame[0..2]` is the
/// marker, `frame[2]` the device type, the rest type-specific.
pub fn decode_frame(frame: &[u8], rssi: Option<i16>) -> Option<DecodedEvent> {
    if frame.len() < 3 || frame[0..2] != VENDOR_MARKER {
        return None;
    }
    let kind = DeviceKind::from_byte(frame[2]);
    let body = &frame[3..];

    let mut fields = Map::new();
    fields.insert("raw_data".to_string(), json!(hex_string(frame)));
    if let Some(rssi) = rssi {
        fields.insert("rssi".to_string(), json!(rssi));
    }
    fields.insert("device_type".to_string(), json!(kind.label()));

    match kind {
        DeviceKind::Blomsterpinne => {
            if body.len() < 4 {
                return None;
            }
            let temperature = u16::from_le_bytes([body[0], body[1]]) as f64 / 100.0;
            fields.insert("temperature".to_string(), json!(temperature));
            fields.insert("humidity".to_string(), json!(body[2]));
            fields.insert("battery".to_string(), json!(body[3]));
        }
        DeviceKind::AccelerometerButton => {
            if body.len() < 4 {
                return None;
            }
            fields.insert("button_state".to_string(), json!(body[0]));
            fields.insert("x_acceleration".to_string(), json!(body[1] as i8));
            fields.insert("y_acceleration".to_string(), json!(body[2] as i8));
            fields.insert("z_acceleration".to_string(), json!(body[3] as i8));
        }
        DeviceKind::Magnetometer => {
            if body.len() < 2 {
                return None;
            }
            fields.insert("button_state".to_string(), json!(body[0]));
            fields.insert("battery".to_string(), json!(body[1]));
        }
        DeviceKind::Unknown(_) => {
            fields.insert("payload".to_string(), json!(hex_string(body)));
        }
    }

    Some(DecodedEvent { kind, fields })
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
