// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fanout Engine: per-tick grouping, per-client subscription filtering,
//! per-client downsampling, and bounded per-connection send queues with
//! drop-newest backpressure and slow-client eviction.

use crate::protocol::{ServerMessage, WavePacketData, WavePayload};
use crate::subscription::SubscriptionRegistry;
use crate::types::ProcessedPacket;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Points represented per pixel of client display width, used to derive
/// the per-client downsample factor.
pub const POINTS_PER_PIXEL: u32 = 1;

/// The assumed window length (seconds) the downsample factor is derived
/// against, independent of how much data is actually in a given packet.
const ASSUMED_WINDOW_SEC: u32 = 120;

/// `downsample_factor = max(1, floor((120*samprate) / (width_px * points_per_pixel)))`.
pub fn downsample_factor(samprate: u32, width_px: u32) -> usize {
    let target = (width_px * POINTS_PER_PIXEL).max(1) as u64;
    let numerator = ASSUMED_WINDOW_SEC as u64 * samprate as u64;
    ((numerator / target) as usize).max(1)
}

/// `downsampled_length = ceil(original_length / downsample_factor)`.
pub fn downsampled_length(original_length: usize, factor: usize) -> usize {
    if factor == 0 {
        return original_length;
    }
    (original_length + factor - 1) / factor
}

/// Stride-decimate `samples` by `factor`. No anti-alias filter: the input
/// is already band-limited by the Signal Pipeline.
pub fn downsample(samples: &[f64], factor: usize) -> Vec<f64> {
    if factor <= 1 {
        return samples.to_vec();
    }
    samples.iter().step_by(factor).copied().collect()
}

pub fn build_wave_payload(packet: &ProcessedPacket, width_px: u32) -> WavePayload {
    let factor = downsample_factor(packet.samprate, width_px);
    let original_length = packet.samples.len();
    let waveform = downsample(&packet.samples, factor);
    WavePayload {
        downsampled_length: downsampled_length(original_length, factor),
        waveform,
        pga: packet.pga,
        startt: packet.startt,
        endt: packet.endt,
        samprate: packet.samprate,
        effective_samprate: packet.samprate as f64 / factor as f64,
        original_length,
        downsample_factor: factor,
    }
}

struct ClientQueue {
    sender: mpsc::Sender<ServerMessage>,
    dropped: AtomicU64,
}

/// Outcome of enqueueing a frame for one client, used by callers to decide
/// whether the connection needs purging from the registry.
pub enum EnqueueOutcome {
    Sent,
    DroppedFull,
    ClientGone,
}

/// Fans processed-packet ticks out to subscribed clients and broadcasts
/// pick/EEW frames to everyone.
pub struct FanoutEngine {
    registry: std::sync::Arc<SubscriptionRegistry>,
    clients: DashMap<String, ClientQueue>,
    queue_capacity: usize,
}

impl FanoutEngine {
    pub fn new(registry: std::sync::Arc<SubscriptionRegistry>, queue_capacity: usize) -> Self {
        Self {
            registry,
            clients: DashMap::new(),
            queue_capacity,
        }
    }

    pub fn register_client(&self, conn_id: &str) -> mpsc::Receiver<ServerMessage> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.clients.insert(
            conn_id.to_string(),
            ClientQueue {
                sender: tx,
                dropped: AtomicU64::new(0),
            },
        );
        rx
    }

    /// Hands back a clone of a registered client's send half, so callers
    /// (e.g. an ephemeral historical-query task) can push frames onto the
    /// same queue the live path uses.
    pub fn clone_sender(&self, conn_id: &str) -> Option<mpsc::Sender<ServerMessage>> {
        self.clients.get(conn_id).map(|q| q.sender.clone())
    }

    pub fn remove_client(&self, conn_id: &str) {
        self.clients.remove(conn_id);
        self.registry.on_disconnect(conn_id);
    }

    /// Dispatch one SP tick: group by wave_id (already the shape of
    /// `packets`), filter per client via the subscription registry,
    /// downsample per client resolution, and enqueue.
    pub fn dispatch_tick(&self, tick_id: &str, timestamp_ms: u64, packets: &[ProcessedPacket]) {
        if packets.is_empty() || self.clients.is_empty() {
            return;
        }

        let mut stale = Vec::new();
        for entry in self.clients.iter() {
            let conn_id = entry.key().clone();
            let width_px = self.registry.display_width_px(&conn_id);

            let mut data = std::collections::HashMap::new();
            for packet in packets {
                if self
                    .registry
                    .matching_connections(&packet.wave_id)
                    .iter()
                    .any(|c| c == &conn_id)
                {
                    data.insert(
                        packet.wave_id.as_str().to_string(),
                        build_wave_payload(packet, width_px),
                    );
                }
            }

            if data.is_empty() {
                continue;
            }

            let frame = ServerMessage::WavePacket(WavePacketData {
                waveid: tick_id.to_string(),
                timestamp: timestamp_ms,
                data,
            });

            match self.enqueue(&conn_id, frame) {
                EnqueueOutcome::ClientGone => stale.push(conn_id),
                _ => {}
            }
        }

        for conn_id in stale {
            self.remove_client(&conn_id);
        }
    }

    /// Broadcast a frame (pick/EEW) to every connected client, skipping
    /// the subscription filter entirely.
    pub fn broadcast(&self, frame: ServerMessage) {
        let mut stale = Vec::new();
        for entry in self.clients.iter() {
            if let EnqueueOutcome::ClientGone = self.enqueue(entry.key(), frame.clone()) {
                stale.push(entry.key().clone());
            }
        }
        for conn_id in stale {
            self.remove_client(&conn_id);
        }
    }

    pub fn enqueue(&self, conn_id: &str, frame: ServerMessage) -> EnqueueOutcome {
        let Some(queue) = self.clients.get(conn_id) else {
            return EnqueueOutcome::ClientGone;
        };
        match queue.sender.try_send(frame) {
            Ok(()) => EnqueueOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = queue.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 500 == 0 {
                    warn!("client {} queue full, dropped {} frames", conn_id, dropped);
                }
                EnqueueOutcome::DroppedFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("client {} transport gone, purging", conn_id);
                EnqueueOutcome::ClientGone
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WaveId;

    #[test]
    fn downsample_factor_matches_formula() {
        // samprate=100, width_px=1000 -> factor = floor(120*100/1000) = 12
        let factor = downsample_factor(100, 1000);
        assert_eq!(factor, 12);
        assert_eq!(downsampled_length(200, factor), 17); // ceil(200/12)
    }

    #[test]
    fn downsample_factor_floors_at_one() {
        // A huge width means the target exceeds total samples: factor clamps to 1.
        assert_eq!(downsample_factor(100, 1_000_000), 1);
    }

    #[test]
    fn downsample_takes_every_nth_sample() {
        let samples: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let out = downsample(&samples, 3);
        assert_eq!(out, vec![0.0, 3.0, 6.0, 9.0]);
    }

    fn processed(wave_id: &str, samples: Vec<f64>) -> ProcessedPacket {
        ProcessedPacket {
            wave_id: WaveId(wave_id.to_string()),
            startt: 1000.0,
            endt: 1002.0,
            samprate: 100,
            samples,
            pga: 1.0,
        }
    }

    #[tokio::test]
    async fn subscribed_client_receives_matching_wave() {
        let registry = std::sync::Arc::new(SubscriptionRegistry::new(1000));
        registry.subscribe("C", vec!["STA01".to_string()]);
        let engine = FanoutEngine::new(registry, 10);
        let mut rx = engine.register_client("C");

        engine.dispatch_tick(
            "batch_1",
            1000,
            &[processed("SM.STA01.01.HLZ", vec![1000.0; 200])],
        );

        let frame = rx.try_recv().expect("expected a frame");
        match frame {
            ServerMessage::WavePacket(data) => {
                let payload = data.data.get("SM.STA01.01.HLZ").unwrap();
                assert!(payload.pga > 0.0);
                assert!(payload.pga <= 1000.0);
                assert_eq!(
                    payload.downsampled_length,
                    downsampled_length(200, payload.downsample_factor)
                );
            }
            _ => panic!("expected WavePacket"),
        }
    }

    #[tokio::test]
    async fn unsubscribed_client_receives_nothing() {
        let registry = std::sync::Arc::new(SubscriptionRegistry::new(1000));
        registry.subscribe("C", vec!["OTHER".to_string()]);
        let engine = FanoutEngine::new(registry, 10);
        let mut rx = engine.register_client("C");

        engine.dispatch_tick(
            "batch_1",
            1000,
            &[processed("SM.STA01.01.HLZ", vec![1.0; 10])],
        );

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_drops_newest_without_closing() {
        let registry = std::sync::Arc::new(SubscriptionRegistry::new(1000));
        registry.subscribe("C", vec!["STA01".to_string()]);
        let engine = FanoutEngine::new(registry, 1);
        let _rx = engine.register_client("C");

        // First fills the one-slot queue, second should drop (not evict).
        engine.dispatch_tick("t1", 1, &[processed("SM.STA01.01.HLZ", vec![1.0; 10])]);
        engine.dispatch_tick("t2", 2, &[processed("SM.STA01.01.HLZ", vec![1.0; 10])]);

        assert_eq!(engine.client_count(), 1);
    }

    #[tokio::test]
    async fn dropped_receiver_evicts_client_on_next_dispatch() {
        let registry = std::sync::Arc::new(SubscriptionRegistry::new(1000));
        registry.subscribe("C", vec!["STA01".to_string()]);
        let engine = FanoutEngine::new(registry, 10);
        let rx = engine.register_client("C");
        drop(rx);

        engine.dispatch_tick("t1", 1, &[processed("SM.STA01.01.HLZ", vec![1.0; 10])]);

        assert_eq!(engine.client_count(), 0);
    }
}
