// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscription Registry: client -> station set, and the inverse index
//! station -> client set, plus the `__ALL_Z__` wildcard.

use crate::types::{WaveId, ALL_Z_WILDCARD};
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;

/// Per-connection subscription state.
struct ConnState {
    stations: HashSet<String>,
    display_width_px: u32,
}

/// Tracks per-client station subscriptions and the inverse station ->
/// clients index. Mutations are serialized per entry via `DashMap`;
/// `match_for`/`matching_connections` read a consistent snapshot without
/// blocking the fanout path on registry writers.
pub struct SubscriptionRegistry {
    by_conn: DashMap<String, ConnState>,
    by_station: DashMap<String, DashSet<String>>,
    wildcard_conns: DashSet<String>,
    default_display_width_px: u32,
}

impl SubscriptionRegistry {
    pub fn new(default_display_width_px: u32) -> Self {
        Self {
            by_conn: DashMap::new(),
            by_station: DashMap::new(),
            wildcard_conns: DashSet::new(),
            default_display_width_px,
        }
    }

    /// Replace `conn`'s station set with `stations`. The single-element
    /// list `["__ALL_Z__"]` is accepted as the wildcard subscription.
    pub fn subscribe(&self, conn: &str, stations: Vec<String>) {
        self.clear_indexes_for(conn);

        let is_wildcard = stations.len() == 1 && stations[0] == ALL_Z_WILDCARD;
        if is_wildcard {
            self.wildcard_conns.insert(conn.to_string());
        } else {
            for station in &stations {
                self.by_station
                    .entry(station.clone())
                    .or_insert_with(DashSet::new)
                    .insert(conn.to_string());
            }
        }

        let width = self
            .by_conn
            .get(conn)
            .map(|c| c.display_width_px)
            .unwrap_or(self.default_display_width_px);

        self.by_conn.insert(
            conn.to_string(),
            ConnState {
                stations: stations.into_iter().collect(),
                display_width_px: width,
            },
        );
    }

    /// Removes `conn` from the station index but keeps its display-width
    /// setting (a no-op station list without disconnecting).
    pub fn unsubscribe(&self, conn: &str) {
        self.clear_indexes_for(conn);
        if let Some(mut entry) = self.by_conn.get_mut(conn) {
            entry.stations.clear();
        }
    }

    /// Fully removes `conn` from every index.
    pub fn on_disconnect(&self, conn: &str) {
        self.clear_indexes_for(conn);
        self.by_conn.remove(conn);
    }

    pub fn set_resolution(&self, conn: &str, width_px: u32) {
        self.by_conn
            .entry(conn.to_string())
            .or_insert_with(|| ConnState {
                stations: HashSet::new(),
                display_width_px: self.default_display_width_px,
            })
            .display_width_px = width_px;
    }

    pub fn display_width_px(&self, conn: &str) -> u32 {
        self.by_conn
            .get(conn)
            .map(|c| c.display_width_px)
            .unwrap_or(self.default_display_width_px)
    }

    /// Connections whose subscription currently covers `wave_id`: its
    /// station is in the conn's set, or the conn holds the wildcard and
    /// the wave_id's channel ends with 'Z'.
    pub fn matching_connections(&self, wave_id: &WaveId) -> Vec<String> {
        let mut matches: HashSet<String> = HashSet::new();

        if let Some(conns) = self.by_station.get(wave_id.station()) {
            matches.extend(conns.iter().map(|c| c.clone()));
        }

        if wave_id.channel().ends_with('Z') {
            matches.extend(self.wildcard_conns.iter().map(|c| c.clone()));
        }

        matches.into_iter().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.by_conn.len()
    }

    fn clear_indexes_for(&self, conn: &str) {
        self.wildcard_conns.remove(conn);
        for station in self.by_station.iter() {
            station.value().remove(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_any_z_channel() {
        let registry = SubscriptionRegistry::new(1000);
        registry.subscribe("C", vec![ALL_Z_WILDCARD.to_string()]);

        let hlz = WaveId::from_raw("SM", "A", "01", "HLZ");
        let hle = WaveId::from_raw("SM", "B", "01", "HLE");
        let bhz = WaveId::from_raw("SM", "C", "01", "BHZ");

        assert!(registry.matching_connections(&hlz).contains(&"C".to_string()));
        assert!(!registry.matching_connections(&hle).contains(&"C".to_string()));
        assert!(registry.matching_connections(&bhz).contains(&"C".to_string()));
    }

    #[test]
    fn subscribe_matches_by_station_code() {
        let registry = SubscriptionRegistry::new(1000);
        registry.subscribe("C", vec!["STA01".to_string()]);

        let matched = WaveId::from_raw("SM", "STA01", "01", "HLZ");
        let unmatched = WaveId::from_raw("SM", "STA02", "01", "HLZ");

        assert!(registry
            .matching_connections(&matched)
            .contains(&"C".to_string()));
        assert!(!registry
            .matching_connections(&unmatched)
            .contains(&"C".to_string()));
    }

    #[test]
    fn resubscribe_replaces_station_set() {
        let registry = SubscriptionRegistry::new(1000);
        registry.subscribe("C", vec!["A".to_string()]);
        registry.subscribe("C", vec!["B".to_string()]);

        let a = WaveId::from_raw("SM", "A", "01", "HLZ");
        let b = WaveId::from_raw("SM", "B", "01", "HLZ");
        assert!(!registry.matching_connections(&a).contains(&"C".to_string()));
        assert!(registry.matching_connections(&b).contains(&"C".to_string()));
    }

    #[test]
    fn disconnect_purges_all_indexes() {
        let registry = SubscriptionRegistry::new(1000);
        registry.subscribe("C", vec![ALL_Z_WILDCARD.to_string()]);
        registry.on_disconnect("C");

        let hlz = WaveId::from_raw("SM", "A", "01", "HLZ");
        assert!(registry.matching_connections(&hlz).is_empty());
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn resolution_defaults_then_can_be_set() {
        let registry = SubscriptionRegistry::new(1000);
        assert_eq!(registry.display_width_px("C"), 1000);
        registry.set_resolution("C", 1920);
        assert_eq!(registry.display_width_px("C"), 1920);
    }
}
