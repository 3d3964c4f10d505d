// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bus Reader: tails the live wave streams (Z-channels only, discovered
//! periodically) plus the singleton `pick` and `eew` streams, decoding
//! records and handing them to the rest of the dispatcher.

use crate::bus::Bus;
use crate::types::{Pick, RawPacket, SampleDataType};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{error, warn};

/// Key discovery interval for the live wave path.
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(5);
const READ_BLOCK_MS: u64 = 100;
const READ_COUNT: usize = 100;
const BACKOFF: Duration = Duration::from_millis(100);

/// Counters exposed for `/health`; mirrors the route-statistics style
/// used elsewhere in the dispatcher.
#[derive(Default)]
pub struct ReaderStats {
    pub messages_received: AtomicU64,
    pub malformed_dropped: AtomicU64,
    pub bus_errors: AtomicU64,
}

fn get_string_field(fields: &HashMap<String, Vec<u8>>, name: &str) -> Option<String> {
    fields
        .get(name)
        .map(|b| String::from_utf8_lossy(b).into_owned())
}

pub(crate) fn parse_raw_packet(fields: &HashMap<String, Vec<u8>>) -> Option<RawPacket> {
    let network = get_string_field(fields, "network").unwrap_or_default();
    let location = get_string_field(fields, "location").unwrap_or_default();
    let startt: f64 = get_string_field(fields, "startt")?.parse().ok()?;
    let endt: f64 = get_string_field(fields, "endt")?.parse().ok()?;
    let samprate: u32 = get_string_field(fields, "samprate")?.parse().ok()?;
    let datatype = get_string_field(fields, "datatype").unwrap_or_else(|| "i4".to_string());
    let data = fields.get("data")?;

    let samples = SampleDataType::from_tag(&datatype).decode(data);

    // station/channel are not on the wire record itself; callers fill
    // them in from the stream key, so this parses only the payload shape.
    Some(RawPacket {
        station: String::new(),
        channel: String::new(),
        network,
        location,
        startt,
        endt,
        samprate,
        samples,
    })
}

pub(crate) fn station_channel_from_key(key: &str) -> Option<(String, String)> {
    // "wave:{station}:{channel}"
    let mut parts = key.splitn(3, ':');
    let prefix = parts.next()?;
    if prefix != "wave" {
        return None;
    }
    let station = parts.next()?.to_string();
    let channel = parts.next()?.to_string();
    Some((station, channel))
}

/// Long-lived task: periodic Z-channel key discovery plus a bounded tail
/// read, forwarding decoded packets to `on_packet`.
pub async fn run_wave_reader(
    bus: &dyn Bus,
    stats: &ReaderStats,
    mut on_packet: impl FnMut(RawPacket),
) -> ! {
    let mut last_ids: HashMap<String, String> = HashMap::new();
    let mut last_discovery = tokio::time::Instant::now() - DISCOVERY_INTERVAL;
    let mut logged_malformed: HashSet<(String, String)> = HashSet::new();

    loop {
        if last_discovery.elapsed() >= DISCOVERY_INTERVAL {
            match bus.scan("wave:*:*Z").await {
                Ok(keys) => {
                    for key in keys {
                        // New keys start at the bus's earliest retained offset so a
                        // just-started reader doesn't miss recently retained data.
                        last_ids.entry(key).or_insert_with(|| "0-0".to_string());
                    }
                    last_discovery = tokio::time::Instant::now();
                }
                Err(e) => {
                    stats.bus_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("wave key discovery failed: {e}");
                }
            }
        }

        if last_ids.is_empty() {
            tokio::time::sleep(BACKOFF).await;
            continue;
        }

        let keys: Vec<(&str, &str)> = last_ids
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        match bus.xread(&keys, READ_COUNT, READ_BLOCK_MS).await {
            Ok(by_key) => {
                for (key, entries) in by_key {
                    let Some((station, channel)) = station_channel_from_key(&key) else {
                        continue;
                    };
                    for entry in entries {
                        last_ids.insert(key.clone(), entry.id.clone());
                        stats.messages_received.fetch_add(1, Ordering::Relaxed);
                        match parse_raw_packet(&entry.fields) {
                            Some(mut packet) => {
                                packet.station = station.clone();
                                packet.channel = channel.clone();
                                on_packet(packet);
                            }
                            None => {
                                stats.malformed_dropped.fetch_add(1, Ordering::Relaxed);
                                if logged_malformed.insert((station.clone(), channel.clone())) {
                                    warn!("malformed wave record on {key}, dropping (further occurrences for this station/channel are suppressed)");
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => {
                stats.bus_errors.fetch_add(1, Ordering::Relaxed);
                error!("wave reader bus error: {e}");
                tokio::time::sleep(BACKOFF).await;
            }
        }
    }
}

pub(crate) fn parse_pick(bytes: &[u8]) -> Option<Pick> {
    serde_json::from_slice(bytes).ok()
}

/// Best-effort `(station, channel)` extraction from a pick record that
/// failed to parse as a [`Pick`], used only to key the malformed-record
/// log dedup below. Falls back to `"unknown"` for either field, or both,
/// when even this lenient parse fails.
fn station_channel_hint(bytes: &[u8]) -> (String, String) {
    let value: Option<serde_json::Value> = serde_json::from_slice(bytes).ok();
    let field = |name: &str| {
        value
            .as_ref()
            .and_then(|v| v.get(name))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string()
    };
    (field("station"), field("channel"))
}

/// Long-lived task tailing the `pick` singleton stream from the bus tip.
pub async fn run_pick_reader(
    bus: &dyn Bus,
    stats: &ReaderStats,
    mut on_pick: impl FnMut(Pick),
) -> ! {
    let mut last_id = "$".to_string();
    let mut logged_malformed: HashSet<(String, String)> = HashSet::new();
    loop {
        match bus
            .xread(&[("pick", last_id.as_str())], READ_COUNT, READ_BLOCK_MS)
            .await
        {
            Ok(by_key) => {
                if let Some(entries) = by_key.get("pick") {
                    for entry in entries {
                        last_id = entry.id.clone();
                        stats.messages_received.fetch_add(1, Ordering::Relaxed);
                        let raw_data = entry.fields.get("data");
                        match raw_data.and_then(|d| parse_pick(d)) {
                            Some(pick) => on_pick(pick),
                            None => {
                                stats.malformed_dropped.fetch_add(1, Ordering::Relaxed);
                                let hint = raw_data
                                    .map(|d| station_channel_hint(d))
                                    .unwrap_or_else(|| ("unknown".to_string(), "unknown".to_string()));
                                if logged_malformed.insert(hint) {
                                    warn!("malformed pick record, dropping (further occurrences for this station/channel are suppressed)");
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => {
                stats.bus_errors.fetch_add(1, Ordering::Relaxed);
                error!("pick reader bus error: {e}");
                tokio::time::sleep(BACKOFF).await;
            }
        }
    }
}

/// Long-lived task tailing the `eew` singleton stream from the bus tip,
/// broadcasting the opaque payload verbatim.
pub async fn run_eew_reader(
    bus: &dyn Bus,
    stats: &ReaderStats,
    mut on_eew: impl FnMut(String),
) -> ! {
    let mut last_id = "$".to_string();
    loop {
        match bus
            .xread(&[("eew", last_id.as_str())], READ_COUNT, READ_BLOCK_MS)
            .await
        {
            Ok(by_key) => {
                if let Some(entries) = by_key.get("eew") {
                    for entry in entries {
                        last_id = entry.id.clone();
                        stats.messages_received.fetch_add(1, Ordering::Relaxed);
                        if let Some(data) = entry.fields.get("data") {
                            on_eew(String::from_utf8_lossy(data).into_owned());
                        }
                    }
                }
            }
            Err(e) => {
                stats.bus_errors.fetch_add(1, Ordering::Relaxed);
                error!("eew reader bus error: {e}");
                tokio::time::sleep(BACKOFF).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn station_channel_parses_wave_key() {
        assert_eq!(
            station_channel_from_key("wave:STA01:HLZ"),
            Some(("STA01".to_string(), "HLZ".to_string()))
        );
        assert_eq!(station_channel_from_key("pick"), None);
    }

    #[test]
    fn parse_raw_packet_decodes_i4_samples() {
        let mut fields = HashMap::new();
        fields.insert("network".to_string(), b"SM".to_vec());
        fields.insert("location".to_string(), b"01".to_vec());
        fields.insert("startt".to_string(), b"1000.0".to_vec());
        fields.insert("endt".to_string(), b"1002.0".to_vec());
        fields.insert("samprate".to_string(), b"100".to_vec());
        fields.insert("datatype".to_string(), b"i4".to_vec());
        let samples: Vec<u8> = 1234_i32.to_le_bytes().to_vec();
        fields.insert("data".to_string(), samples);

        let packet = parse_raw_packet(&fields).unwrap();
        assert_eq!(packet.samples, vec![1234.0]);
        assert_eq!(packet.samprate, 100);
    }

    #[test]
    fn parse_raw_packet_rejects_missing_required_field() {
        let fields = HashMap::new();
        assert!(parse_raw_packet(&fields).is_none());
    }
}
