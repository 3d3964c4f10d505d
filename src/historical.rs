// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Historical Query Handler: on client request, range-scans the bus,
//! reassembles contiguous traces, re-runs the Signal Pipeline with a
//! start-edge taper, re-slices into 5-second packets, and streams them to
//! the requesting client interleaved with the live path.

use crate::bus::Bus;
use crate::error::HistoricalError;
use crate::fanout::build_wave_payload;
use crate::pick_dedup::dedupe_for_historical;
use crate::protocol::{HistoricalPicksData, ServerMessage, WavePacketData};
use crate::reader::{parse_pick, parse_raw_packet, station_channel_from_key};
use crate::signal::SignalPipeline;
use crate::types::{CalibrationTable, Pick, RawPacket, WaveId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Width of one re-sliced historical packet.
const SLICE_SEC: f64 = 5.0;
/// Pacing between emitted frames so a burst of historical data doesn't
/// overwhelm the client.
const INTER_FRAME_PAUSE: Duration = Duration::from_millis(10);

fn ms_id(seconds: f64, suffix: &str) -> String {
    format!("{}-{}", (seconds * 1000.0) as i64, suffix)
}

/// Enumerate the stream keys to scan for a historical request: either the
/// requested stations' Z-channels, or every Z-channel for the wildcard.
pub async fn resolve_stream_keys(
    bus: &dyn Bus,
    stations: &[String],
) -> Result<Vec<String>, HistoricalError> {
    let is_wildcard = stations.len() == 1 && stations[0] == crate::types::ALL_Z_WILDCARD;
    let pattern_keys = if is_wildcard {
        vec!["wave:*:*Z".to_string()]
    } else {
        stations
            .iter()
            .map(|station| format!("wave:{station}:*Z"))
            .collect()
    };

    let mut keys = Vec::new();
    for pattern in pattern_keys {
        keys.extend(bus.scan(&pattern).await.map_err(HistoricalError::from)?);
    }
    Ok(keys)
}

struct ReassembledTrace {
    wave_id: WaveId,
    samprate: u32,
    samples: Vec<f64>,
    start_offset_sec: f64,
}

/// Fetch, sort, and concatenate one key's chunks into a single contiguous
/// trace, recording the earliest `startt` seen.
fn reassemble(key_fields: Vec<(String, HashMap<String, Vec<u8>>)>) -> Option<ReassembledTrace> {
    let Some((station, channel)) = station_channel_from_key(&key_fields.first()?.0) else {
        return None;
    };

    let mut packets: Vec<RawPacket> = key_fields
        .into_iter()
        .filter_map(|(_, fields)| {
            let mut packet = parse_raw_packet(&fields)?;
            packet.station = station.clone();
            packet.channel = channel.clone();
            Some(packet)
        })
        .collect();

    if packets.is_empty() {
        return None;
    }
    packets.sort_by(|a, b| a.startt.partial_cmp(&b.startt).unwrap());

    let wave_id = packets[0].wave_id();
    let samprate = packets[0].samprate;
    let start_offset_sec = packets[0].startt;
    let samples: Vec<f64> = packets.into_iter().flat_map(|p| p.samples).collect();

    Some(ReassembledTrace {
        wave_id,
        samprate,
        samples,
        start_offset_sec,
    })
}

/// Re-slice a processed, tapered trace into 5-second windows indexed by
/// `floor(startt / 5)`.
fn slice_into_5s_windows(
    trace: &ReassembledTrace,
    filtered: &[f64],
) -> Vec<(i64, f64, f64, Vec<f64>)> {
    let samprate = trace.samprate as f64;
    let slice_len = (SLICE_SEC * samprate).round() as usize;
    if slice_len == 0 {
        return Vec::new();
    }

    filtered
        .chunks(slice_len)
        .enumerate()
        .map(|(i, chunk)| {
            let chunk_start = trace.start_offset_sec + i as f64 * SLICE_SEC;
            let window_index = (chunk_start / SLICE_SEC).floor() as i64;
            let chunk_end = chunk_start + chunk.len() as f64 / samprate;
            (window_index, chunk_start, chunk_end, chunk.to_vec())
        })
        .collect()
}

/// Run a historical query end to end, streaming `historical_data` frames
/// and a final `historical_picks_batch` frame to `tx`.
pub async fn run_historical_query(
    bus: &dyn Bus,
    signal: &SignalPipeline,
    calibration: &CalibrationTable,
    stations: Vec<String>,
    window_seconds: u64,
    retention_sec: u64,
    display_width_px: u32,
    now: f64,
    tx: &mpsc::Sender<ServerMessage>,
) -> Result<(), HistoricalError> {
    if window_seconds > retention_sec {
        return Err(HistoricalError::WindowTooLarge {
            requested: window_seconds,
            retention: retention_sec,
        });
    }

    let start = now - window_seconds as f64;
    let min_id = ms_id(start, "0");
    let max_id = ms_id(now, "0");

    let keys = resolve_stream_keys(bus, &stations).await?;
    let by_key = bus.xrange_pipeline(&keys, &min_id, &max_id).await?;

    let mut traces: Vec<ReassembledTrace> = Vec::new();
    for (key, entries) in by_key {
        let fields: Vec<(String, HashMap<String, Vec<u8>>)> = entries
            .into_iter()
            .map(|e| (key.clone(), e.fields))
            .collect();
        if let Some(trace) = reassemble(fields) {
            traces.push(trace);
        }
    }

    let mut windows: HashMap<i64, HashMap<String, (f64, f64, crate::protocol::WavePayload)>> =
        HashMap::new();

    for trace in &traces {
        let filtered = {
            let raw = RawPacket {
                station: String::new(),
                channel: String::new(),
                network: String::new(),
                location: String::new(),
                startt: trace.start_offset_sec,
                endt: trace.start_offset_sec,
                samprate: trace.samprate,
                samples: trace.samples.clone(),
            };
            signal.process_one_historical(&raw, calibration).samples
        };

        for (window_index, chunk_start, chunk_end, chunk) in slice_into_5s_windows(trace, &filtered)
        {
            let packet = crate::types::ProcessedPacket {
                wave_id: trace.wave_id.clone(),
                startt: chunk_start,
                endt: chunk_end,
                samprate: trace.samprate,
                pga: crate::types::ProcessedPacket::pga_of(&chunk),
                samples: chunk,
            };
            let payload = build_wave_payload(&packet, display_width_px);
            windows
                .entry(window_index)
                .or_default()
                .insert(trace.wave_id.as_str().to_string(), (chunk_start, chunk_end, payload));
        }
    }

    let mut ordered_windows: Vec<i64> = windows.keys().copied().collect();
    ordered_windows.sort_unstable();

    for (i, window_index) in ordered_windows.iter().enumerate() {
        let data = windows.remove(window_index).unwrap();
        let timestamp_ms = (now * 1000.0) as u64;
        let frame = ServerMessage::HistoricalData(WavePacketData {
            waveid: format!("historical_{timestamp_ms}_{i}"),
            timestamp: timestamp_ms,
            data: data
                .into_iter()
                .map(|(wid, (_, _, payload))| (wid, payload))
                .collect(),
        });
        if tx.send(frame).await.is_err() {
            // Requester disconnected; stop streaming but don't treat it as an error.
            return Ok(());
        }
        tokio::time::sleep(INTER_FRAME_PAUSE).await;
    }

    if let Err(e) = emit_historical_picks(bus, &stations, start, now, tx).await {
        warn!("historical picks fetch failed: {e}");
    }

    Ok(())
}

async fn emit_historical_picks(
    bus: &dyn Bus,
    _stations: &[String],
    start: f64,
    end: f64,
    tx: &mpsc::Sender<ServerMessage>,
) -> Result<(), HistoricalError> {
    let min_id = ms_id(start, "0");
    let max_id = ms_id(end, "0");
    let entries = bus.xrange("pick", &min_id, &max_id).await?;

    let picks: Vec<Pick> = entries
        .iter()
        .filter_map(|e| e.fields.get("data").and_then(|d| parse_pick(d)))
        .collect();
    let deduped = dedupe_for_historical(picks);
    let count = deduped.len();

    let frame = ServerMessage::HistoricalPicksBatch(HistoricalPicksData {
        picks: deduped,
        count,
    });
    let _ = tx.send(frame).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(startt: f64, samples: Vec<f64>) -> ReassembledTrace {
        ReassembledTrace {
            wave_id: WaveId::from_raw("SM", "X", "01", "HLZ"),
            samprate: 100,
            samples,
            start_offset_sec: startt,
        }
    }

    #[test]
    fn slices_cover_window_without_overlap() {
        let t = trace(0.0, vec![1.0; 1000]); // 10 seconds at 100 Hz
        let slices = slice_into_5s_windows(&t, &t.samples.clone());
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].0, 0);
        assert_eq!(slices[1].0, 1);
        assert!((slices[0].2 - slices[1].1).abs() < 1e-9);
    }

    #[test]
    fn reassemble_concatenates_sorted_by_startt() {
        let mut fields_a = HashMap::new();
        fields_a.insert("network".to_string(), b"SM".to_vec());
        fields_a.insert("location".to_string(), b"01".to_vec());
        fields_a.insert("startt".to_string(), b"1005.0".to_vec());
        fields_a.insert("endt".to_string(), b"1006.0".to_vec());
        fields_a.insert("samprate".to_string(), b"100".to_vec());
        fields_a.insert("datatype".to_string(), b"i4".to_vec());
        fields_a.insert("data".to_string(), 2_i32.to_le_bytes().to_vec());

        let mut fields_b = fields_a.clone();
        fields_b.insert("startt".to_string(), b"1000.0".to_vec());
        fields_b.insert("data".to_string(), 1_i32.to_le_bytes().to_vec());

        let reassembled = reassemble(vec![
            ("wave:X:HLZ".to_string(), fields_a),
            ("wave:X:HLZ".to_string(), fields_b),
        ])
        .unwrap();

        assert_eq!(reassembled.samples, vec![1.0, 2.0]);
        assert_eq!(reassembled.start_offset_sec, 1000.0);
    }
}
