// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Core data types shared by every dispatcher component.
//!
//! These mirror the station/channel/network/location (SCNL) naming used
//! across the seismic network and the wire shapes read off the bus.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `(station_code, channel_code)` — identity for buffers, calibration
/// lookups, and stream keys. ASCII, typically ≤ 8 chars each.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StationKey {
    pub station: String,
    pub channel: String,
}

impl StationKey {
    pub fn new(station: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            station: station.into(),
            channel: channel.into(),
        }
    }
}

/// Canonical `"{network}.{station}.{location}.{channel}"` identity for a
/// processed wave. Produced after legacy-naming normalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WaveId(pub String);

impl WaveId {
    /// Build a WaveId from raw fields, applying the legacy `TW` rename:
    /// `network == "TW"` becomes `network = "SM"`, `location = "01"`.
    pub fn from_raw(network: &str, station: &str, location: &str, channel: &str) -> Self {
        let (network, location) = if network == "TW" {
            ("SM", "01")
        } else {
            (network, location)
        };
        Self(format!("{network}.{station}.{location}.{channel}"))
    }

    /// The channel component, used for Z-channel and wildcard matching.
    pub fn channel(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or("")
    }

    /// The station component.
    pub fn station(&self) -> &str {
        self.0.split('.').nth(1).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Raw sample encoding carried in a bus record's `datatype` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleDataType {
    I16,
    I32,
    F32,
    F64,
}

impl SampleDataType {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "i2" => Self::I16,
            "f4" => Self::F32,
            "f8" => Self::F64,
            // "i4" and anything unrecognized default to the modern int32 wire format.
            _ => Self::I32,
        }
    }

    /// Decode a little-endian byte payload into a float64 sample vector.
    pub fn decode(self, bytes: &[u8]) -> Vec<f64> {
        match self {
            Self::I16 => bytes
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]) as f64)
                .collect(),
            Self::I32 => bytes
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
                .collect(),
            Self::F32 => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
                .collect(),
            Self::F64 => bytes
                .chunks_exact(8)
                .map(|c| {
                    f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                })
                .collect(),
        }
    }
}

/// A decoded record as read off a `wave:{station}:{channel}` stream.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub station: String,
    pub channel: String,
    pub network: String,
    pub location: String,
    pub startt: f64,
    pub endt: f64,
    pub samprate: u32,
    pub samples: Vec<f64>,
}

impl RawPacket {
    pub fn station_key(&self) -> StationKey {
        StationKey::new(self.station.clone(), self.channel.clone())
    }

    pub fn wave_id(&self) -> WaveId {
        WaveId::from_raw(&self.network, &self.station, &self.location, &self.channel)
    }
}

/// Output of the Signal Pipeline for one input array.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedPacket {
    #[serde(skip)]
    pub wave_id: WaveId,
    pub startt: f64,
    pub endt: f64,
    pub samprate: u32,
    pub samples: Vec<f64>,
    pub pga: f64,
}

impl ProcessedPacket {
    pub fn pga_of(samples: &[f64]) -> f64 {
        samples.iter().fold(0.0_f64, |m, &s| m.max(s.abs()))
    }
}

/// A detected P-wave arrival, deduplicated by `(station, channel, pick_time)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pick {
    pub station: String,
    pub channel: String,
    pub network: String,
    pub location: String,
    pub lon: f64,
    pub lat: f64,
    pub pga: f64,
    pub pgv: f64,
    pub pd: f64,
    pub tc: f64,
    pub pick_time: f64,
    pub weight: u8,
    pub instrument: u8,
    pub update_sec: u8,
    /// Fields present on the wire but not part of the strict schema above;
    /// preserved rather than discarded.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Pick {
    pub fn dedupe_key(&self) -> (String, String, u64) {
        // pick_time is seconds with sub-second precision on the wire; key on
        // the millisecond-rounded value so retransmits with float noise collide.
        (
            self.station.clone(),
            self.channel.clone(),
            (self.pick_time * 1000.0).round() as u64,
        )
    }
}

/// Marker subscription meaning "any wave_id whose channel ends with 'Z'".
pub const ALL_Z_WILDCARD: &str = "__ALL_Z__";

/// Per-deployment calibration constant when a (station, channel) pair has
/// no entry in the loaded table.
pub const DEFAULT_CALIBRATION_CONSTANT: f64 = 3.2e-6;

/// Immutable `(station, channel) -> counts-to-physical-units` map, read-only
/// after load.
#[derive(Debug, Default)]
pub struct CalibrationTable {
    constants: HashMap<StationKey, f64>,
}

impl CalibrationTable {
    pub fn new(constants: HashMap<StationKey, f64>) -> Self {
        Self { constants }
    }

    /// Looks up the calibration constant for a (station, channel) pair,
    /// falling back to the documented default. Unknown pairs are not an
    /// error; callers should log the miss once per pair.
    pub fn lookup(&self, key: &StationKey) -> f64 {
        *self.constants.get(key).unwrap_or(&DEFAULT_CALIBRATION_CONSTANT)
    }

    pub fn contains(&self, key: &StationKey) -> bool {
        self.constants.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.constants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wave_id_legacy_rename() {
        let id = WaveId::from_raw("TW", "A001", "00", "HLZ");
        assert_eq!(id.as_str(), "SM.A001.01.HLZ");
    }

    #[test]
    fn wave_id_passthrough_for_non_legacy_network() {
        let id = WaveId::from_raw("SM", "A001", "01", "HLZ");
        assert_eq!(id.as_str(), "SM.A001.01.HLZ");
    }

    #[test]
    fn wave_id_channel_and_station_accessors() {
        let id = WaveId::from_raw("SM", "A001", "01", "HLZ");
        assert_eq!(id.channel(), "HLZ");
        assert_eq!(id.station(), "A001");
    }

    #[test]
    fn sample_data_type_from_tag() {
        assert_eq!(SampleDataType::from_tag("i2"), SampleDataType::I16);
        assert_eq!(SampleDataType::from_tag("i4"), SampleDataType::I32);
        assert_eq!(SampleDataType::from_tag("f4"), SampleDataType::F32);
        assert_eq!(SampleDataType::from_tag("f8"), SampleDataType::F64);
        assert_eq!(SampleDataType::from_tag("bogus"), SampleDataType::I32);
    }

    #[test]
    fn decode_i16_little_endian() {
        let bytes = 1000_i16.to_le_bytes();
        let decoded = SampleDataType::I16.decode(&bytes);
        assert_eq!(decoded, vec![1000.0]);
    }

    #[test]
    fn calibration_table_default_fallback() {
        let table = CalibrationTable::default();
        let key = StationKey::new("A001", "HLZ");
        assert_eq!(table.lookup(&key), DEFAULT_CALIBRATION_CONSTANT);
        assert!(!table.contains(&key));
    }
}
