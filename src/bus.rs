// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message bus abstraction and its Redis Streams-backed implementation.
//!
//! The dispatcher is written against the narrow `Bus` trait below so that
//! the properties in the testable-properties list can run against an
//! in-memory fake without a live Redis server.

use crate::error::BusError;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;

/// One entry returned from a stream read or range scan: the bus-assigned
/// `ms-seq` id plus the record's field map.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, Vec<u8>>,
}

/// The bus operations the dispatcher needs: tailing, ranged scans, key
/// discovery, and pipelined ranged scans.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Tail multiple keys starting after each key's last-seen id, blocking
    /// up to `block_ms` and capping at `count` entries per key.
    async fn xread(
        &self,
        keys: &[(&str, &str)],
        count: usize,
        block_ms: u64,
    ) -> Result<HashMap<String, Vec<StreamEntry>>, BusError>;

    /// Time-bounded range scan, inclusive of both bounds.
    async fn xrange(
        &self,
        key: &str,
        min_id: &str,
        max_id: &str,
    ) -> Result<Vec<StreamEntry>, BusError>;

    /// Glob-pattern key enumeration.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, BusError>;

    /// Pipelined range scan across multiple keys in one round trip.
    async fn xrange_pipeline(
        &self,
        keys: &[String],
        min_id: &str,
        max_id: &str,
    ) -> Result<HashMap<String, Vec<StreamEntry>>, BusError>;
}

/// Redis Streams-backed `Bus` implementation.
pub struct RedisBus {
    conn: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(|e| BusError::Config(e.to_string()))?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

fn decode_fields(raw: Vec<(String, redis::Value)>) -> HashMap<String, Vec<u8>> {
    raw.into_iter()
        .filter_map(|(field, value)| match value {
            redis::Value::BulkString(bytes) => Some((field, bytes)),
            redis::Value::SimpleString(s) => Some((field, s.into_bytes())),
            _ => None,
        })
        .collect()
}

#[async_trait]
impl Bus for RedisBus {
    async fn xread(
        &self,
        keys: &[(&str, &str)],
        count: usize,
        block_ms: u64,
    ) -> Result<HashMap<String, Vec<StreamEntry>>, BusError> {
        let mut conn = self.conn.clone();
        let key_names: Vec<&str> = keys.iter().map(|(k, _)| *k).collect();
        let start_ids: Vec<&str> = keys.iter().map(|(_, id)| *id).collect();

        let opts = redis::streams::StreamReadOptions::default()
            .count(count)
            .block(Duration::from_millis(block_ms).as_millis() as usize);

        let reply: redis::streams::StreamReadReply = conn
            .xread_options(&key_names, &start_ids, &opts)
            .await?;

        let mut out = HashMap::new();
        for key_entry in reply.keys {
            let entries = key_entry
                .ids
                .into_iter()
                .map(|id| StreamEntry {
                    id: id.id,
                    fields: decode_fields(id.map.into_iter().collect()),
                })
                .collect();
            out.insert(key_entry.key, entries);
        }
        Ok(out)
    }

    async fn xrange(
        &self,
        key: &str,
        min_id: &str,
        max_id: &str,
    ) -> Result<Vec<StreamEntry>, BusError> {
        let mut conn = self.conn.clone();
        let reply: redis::streams::StreamRangeReply = conn.xrange(key, min_id, max_id).await?;
        Ok(reply
            .ids
            .into_iter()
            .map(|id| StreamEntry {
                id: id.id,
                fields: decode_fields(id.map.into_iter().collect()),
            })
            .collect())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, BusError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.scan_match(pattern).await?.collect().await;
        Ok(keys)
    }

    async fn xrange_pipeline(
        &self,
        keys: &[String],
        min_id: &str,
        max_id: &str,
    ) -> Result<HashMap<String, Vec<StreamEntry>>, BusError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.xrange(key, min_id, max_id);
        }
        let replies: Vec<redis::streams::StreamRangeReply> =
            pipe.query_async(&mut conn).await?;

        let mut out = HashMap::new();
        for (key, reply) in keys.iter().zip(replies.into_iter()) {
            let entries = reply
                .ids
                .into_iter()
                .map(|id| StreamEntry {
                    id: id.id,
                    fields: decode_fields(id.map.into_iter().collect()),
                })
                .collect();
            out.insert(key.clone(), entries);
        }
        Ok(out)
    }
}
