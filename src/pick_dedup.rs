// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pick Deduper: keeps the highest-`update_sec` record per
//! `(station, channel, pick_time)` key and reaps entries past retention.

use crate::types::Pick;
use dashmap::DashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// `update_sec` at which a live pick is first considered stable enough to
/// broadcast (older seismic practice: parameters stabilize by the second
/// retransmit).
pub const LIVE_EMIT_UPDATE_SEC: u8 = 2;

type DedupeKey = (String, String, u64);

struct DedupeEntry {
    pick: Pick,
    received_at: f64,
}

/// Recent `(station, channel, pick_time) -> best Pick` map.
pub struct PickDeduper {
    entries: DashMap<DedupeKey, DedupeEntry>,
    retention_sec: f64,
}

impl PickDeduper {
    pub fn new(retention_sec: f64) -> Self {
        Self {
            entries: DashMap::new(),
            retention_sec,
        }
    }

    /// Accepts a decoded Pick. Returns `true` if this call should trigger
    /// a live broadcast: the key was previously absent or updated, *and*
    /// the incoming `update_sec` is exactly [`LIVE_EMIT_UPDATE_SEC`].
    pub fn accept(&mut self, pick: Pick) -> bool {
        let key = pick.dedupe_key();
        let should_emit = pick.update_sec == LIVE_EMIT_UPDATE_SEC;

        match self.entries.get(&key).map(|e| e.pick.update_sec) {
            None => {
                self.entries.insert(
                    key,
                    DedupeEntry {
                        pick,
                        received_at: now_secs(),
                    },
                );
                should_emit
            }
            Some(stored_update_sec) if pick.update_sec > stored_update_sec => {
                self.entries.insert(
                    key,
                    DedupeEntry {
                        pick,
                        received_at: now_secs(),
                    },
                );
                should_emit
            }
            _ => false,
        }
    }

    /// The current best record for a key, if any.
    pub fn get(&self, station: &str, channel: &str, pick_time: f64) -> Option<Pick> {
        let key = (
            station.to_string(),
            channel.to_string(),
            (pick_time * 1000.0).round() as u64,
        );
        self.entries.get(&key).map(|e| e.pick.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries whose `pick_time` is older than the configured
    /// retention horizon relative to `now`.
    pub fn reap(&self, now: f64) {
        self.entries
            .retain(|_, entry| now - entry.pick.pick_time < self.retention_sec);
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Given a range of picks (e.g. from a historical bus scan), dedupe by
/// `(station, channel, pick_time)` and keep the maximum `update_sec`
/// record for each — the HQ path, which has no live-emission gate.
pub fn dedupe_for_historical(picks: Vec<Pick>) -> Vec<Pick> {
    let mut best: std::collections::HashMap<DedupeKey, Pick> = std::collections::HashMap::new();
    for pick in picks {
        let key = pick.dedupe_key();
        match best.get(&key) {
            Some(existing) if existing.update_sec >= pick.update_sec => {}
            _ => {
                best.insert(key, pick);
            }
        }
    }
    best.into_values().collect()
}
