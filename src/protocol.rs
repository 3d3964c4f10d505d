// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! WebSocket client protocol: JSON text frames in both directions.

use crate::types::Pick;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Client -> server events.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    SubscribeStations { stations: Vec<String> },
    SetDisplayResolution { width: u32 },
    RequestHistoricalData {
        stations: Vec<String>,
        window_seconds: u64,
    },
}

/// One processed wave's payload within a `wave_packet`/`historical_data`
/// frame's `data` map.
#[derive(Debug, Clone, Serialize)]
pub struct WavePayload {
    pub waveform: Vec<f64>,
    pub pga: f64,
    pub startt: f64,
    pub endt: f64,
    pub samprate: u32,
    pub effective_samprate: f64,
    pub original_length: usize,
    pub downsampled_length: usize,
    pub downsample_factor: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WavePacketData {
    pub waveid: String,
    pub timestamp: u64,
    pub data: HashMap<String, WavePayload>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoricalPicksData {
    pub picks: Vec<Pick>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BroadcastContent {
    Pick { content: Pick },
    Eew { content: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastPacketData {
    #[serde(flatten)]
    pub content: BroadcastContent,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorData {
    pub message: String,
}

/// Server -> client events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectInit,
    WavePacket(WavePacketData),
    HistoricalData(WavePacketData),
    HistoricalPicksBatch(HistoricalPicksData),
    PickPacket(BroadcastPacketData),
    EewPacket(BroadcastPacketData),
    Error(ErrorData),
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorData {
            message: message.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_subscribe_stations() {
        let json = r#"{"event":"subscribe_stations","data":{"stations":["A001","A002"]}}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::SubscribeStations { stations } => {
                assert_eq!(stations, vec!["A001", "A002"]);
            }
            _ => panic!("expected SubscribeStations"),
        }
    }

    #[test]
    fn parse_set_display_resolution() {
        let json = r#"{"event":"set_display_resolution","data":{"width":1920}}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::SetDisplayResolution { width } => assert_eq!(width, 1920),
            _ => panic!("expected SetDisplayResolution"),
        }
    }

    #[test]
    fn parse_request_historical_data() {
        let json = r#"{"event":"request_historical_data","data":{"stations":["X"],"window_seconds":120}}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::RequestHistoricalData {
                stations,
                window_seconds,
            } => {
                assert_eq!(stations, vec!["X"]);
                assert_eq!(window_seconds, 120);
            }
            _ => panic!("expected RequestHistoricalData"),
        }
    }

    #[test]
    fn serialize_connect_init() {
        let json = serde_json::to_string(&ServerMessage::ConnectInit).unwrap();
        assert_eq!(json, r#"{"event":"connect_init"}"#);
    }

    #[test]
    fn serialize_error_frame() {
        let json = serde_json::to_string(&ServerMessage::error("boom")).unwrap();
        assert!(json.contains("\"event\":\"error\""));
        assert!(json.contains("boom"));
    }
}
