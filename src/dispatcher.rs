// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dispatcher: owns every shared component and wires the Bus Reader,
//! Signal Pipeline, Window Store, Pick Deduper, Subscription Registry,
//! and Fanout Engine together. Constructed once in `main` and shared via
//! `Arc` with every task — no process-wide singletons.

use crate::bus::Bus;
use crate::config::Args;
use crate::fanout::FanoutEngine;
use crate::pick_dedup::PickDeduper;
use crate::protocol::{BroadcastContent, BroadcastPacketData, ServerMessage};
use crate::reader::{run_eew_reader, run_pick_reader, run_wave_reader, ReaderStats};
use crate::signal::SignalPipeline;
use crate::subscription::SubscriptionRegistry;
use crate::types::CalibrationTable;
use crate::window::WindowStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Shared, long-lived state for the running dispatcher.
pub struct Dispatcher {
    pub bus: Arc<dyn Bus>,
    pub calibration: CalibrationTable,
    pub window_store: WindowStore,
    pub pick_deduper: Mutex<PickDeduper>,
    pub registry: Arc<SubscriptionRegistry>,
    pub fanout: Arc<FanoutEngine>,
    pub signal: SignalPipeline,
    pub reader_stats: ReaderStats,
    pub tick_counter: AtomicU64,
    pub config: Args,
}

impl Dispatcher {
    pub fn new(config: Args, calibration: CalibrationTable, bus: Arc<dyn Bus>) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new(config.default_display_width_px));
        let fanout = Arc::new(FanoutEngine::new(
            registry.clone(),
            config.client_queue_capacity,
        ));
        Self {
            bus,
            calibration,
            window_store: WindowStore::new(config.live_window_sec, 100),
            pick_deduper: Mutex::new(PickDeduper::new(config.historical_retention_sec as f64)),
            registry,
            fanout,
            signal: SignalPipeline::default(),
            reader_stats: ReaderStats::default(),
            tick_counter: AtomicU64::new(0),
            config,
        }
    }

    pub fn next_tick_id(&self) -> String {
        let n = self.tick_counter.fetch_add(1, Ordering::Relaxed);
        format!("batch_{n}")
    }

    /// Spawns the BR tasks (wave, pick, eew) plus the SP batching that
    /// sits between the wave reader and the Fanout Engine.
    pub fn spawn_readers(self: &Arc<Self>) {
        let bus = self.bus.clone();
        let (tx, mut rx) = tokio::sync::mpsc::channel(4096);

        // Bus Reader (wave): decode + hand raw packets to the SP stage via
        // a bounded channel. Drop-newest on overflow so the live path
        // never blocks on a downstream stall.
        {
            let bus = bus.clone();
            let dispatcher = self.clone();
            tokio::spawn(async move {
                run_wave_reader(bus.as_ref(), &dispatcher.reader_stats, |packet| {
                    if let Err(tokio::sync::mpsc::error::TrySendError::Full(_)) =
                        tx.try_send(packet)
                    {
                        tracing::warn!("SP input queue full, dropping newest packet");
                    }
                })
                .await;
            });
        }

        // Signal Pipeline worker: batches whatever's currently queued,
        // writes the scaled+filtered trace into the Window Store, and
        // fans the tick out.
        {
            let dispatcher = self.clone();
            tokio::spawn(async move {
                let mut batch = Vec::new();
                loop {
                    batch.clear();
                    match rx.recv().await {
                        Some(first) => batch.push(first),
                        None => break,
                    }
                    while let Ok(next) = rx.try_recv() {
                        batch.push(next);
                    }

                    let processed = dispatcher.signal.process_batch(&batch, &dispatcher.calibration);
                    for (raw, packet) in batch.iter().zip(processed.iter()) {
                        dispatcher.window_store.write(&raw.station, &packet.samples);
                    }

                    let tick_id = dispatcher.next_tick_id();
                    let timestamp_ms = (now_secs() * 1000.0) as u64;
                    dispatcher.fanout.dispatch_tick(&tick_id, timestamp_ms, &processed);
                }
            });
        }

        // Bus Reader (pick): dedupe, and broadcast on the live-emit gate.
        {
            let bus = bus.clone();
            let dispatcher = self.clone();
            tokio::spawn(async move {
                run_pick_reader(bus.as_ref(), &dispatcher.reader_stats, |pick| {
                    let should_emit = dispatcher
                        .pick_deduper
                        .lock()
                        .expect("pick deduper lock poisoned")
                        .accept(pick.clone());
                    if should_emit {
                        dispatcher.fanout.broadcast(ServerMessage::PickPacket(
                            BroadcastPacketData {
                                content: BroadcastContent::Pick { content: pick },
                                timestamp: (now_secs() * 1000.0) as u64,
                            },
                        ));
                    }
                })
                .await;
            });
        }

        // Bus Reader (eew): broadcast verbatim.
        {
            let dispatcher = self.clone();
            tokio::spawn(async move {
                run_eew_reader(bus.as_ref(), &dispatcher.reader_stats, |content| {
                    dispatcher.fanout.broadcast(ServerMessage::EewPacket(BroadcastPacketData {
                        content: BroadcastContent::Eew { content },
                        timestamp: (now_secs() * 1000.0) as u64,
                    }));
                })
                .await;
            });
        }

        // Pick reaper: drop dedupe entries past the historical retention
        // horizon on a slow interval.
        {
            let dispatcher = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
                loop {
                    interval.tick().await;
                    let now = now_secs();
                    let mut deduper = dispatcher
                        .pick_deduper
                        .lock()
                        .expect("pick deduper lock poisoned");
                    deduper.reap(now);
                    info!("pick deduper reaped; {} entries remain", deduper.len());
                }
            });
        }
    }
}
