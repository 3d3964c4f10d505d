// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Window Store: per-station bounded circular buffer of recent samples.
//!
//! Single-writer/many-reader. Readers take the lock only long enough to
//! copy out a contiguous snapshot; they never hold it across I/O.

use dashmap::DashMap;
use std::sync::RwLock;

/// Fixed-capacity circular buffer for one station's live window.
pub struct WindowBuffer {
    capacity: usize,
    samples: Vec<f64>,
    write_idx: usize,
    filled: bool,
}

impl WindowBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: vec![0.0; capacity],
            write_idx: 0,
            filled: false,
        }
    }

    /// Append `arr` modulo capacity. If `arr.len() >= capacity`, the
    /// buffer is overwritten wholesale with the last `capacity` samples
    /// and the write index resets to 0.
    pub fn write(&mut self, arr: &[f64]) {
        let n = arr.len();
        if n == 0 {
            return;
        }
        if n >= self.capacity {
            let start = n - self.capacity;
            self.samples.copy_from_slice(&arr[start..]);
            self.write_idx = 0;
            self.filled = true;
            return;
        }

        let idx = self.write_idx;
        let end = (idx + n) % self.capacity;
        if idx + n <= self.capacity {
            self.samples[idx..idx + n].copy_from_slice(arr);
        } else {
            let first = self.capacity - idx;
            self.samples[idx..].copy_from_slice(&arr[..first]);
            self.samples[..end].copy_from_slice(&arr[first..]);
        }
        if end <= idx {
            self.filled = true;
        }
        self.write_idx = end;
    }

    /// A freshly-allocated, chronologically-ordered copy of the last
    /// `capacity` samples (tail-from-write-index concatenated with
    /// head-up-to-write-index).
    pub fn snapshot(&self) -> Vec<f64> {
        if !self.filled {
            // Buffer hasn't wrapped yet: the valid region is [0, write_idx).
            return self.samples[..self.write_idx].to_vec();
        }
        if self.write_idx == 0 {
            return self.samples.clone();
        }
        let mut out = Vec::with_capacity(self.capacity);
        out.extend_from_slice(&self.samples[self.write_idx..]);
        out.extend_from_slice(&self.samples[..self.write_idx]);
        out
    }

    pub fn write_idx(&self) -> usize {
        self.write_idx
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Owns one [`WindowBuffer`] per station, created lazily on first packet.
/// WindowBuffers are never destroyed during normal operation.
pub struct WindowStore {
    capacity: usize,
    buffers: DashMap<String, RwLock<WindowBuffer>>,
}

impl WindowStore {
    pub fn new(window_sec: u64, samprate: u32) -> Self {
        Self {
            capacity: (window_sec as u32 * samprate) as usize,
            buffers: DashMap::new(),
        }
    }

    pub fn write(&self, station: &str, arr: &[f64]) {
        let entry = self
            .buffers
            .entry(station.to_string())
            .or_insert_with(|| RwLock::new(WindowBuffer::new(self.capacity)));
        entry.write().expect("window buffer lock poisoned").write(arr);
    }

    pub fn snapshot(&self, station: &str) -> Vec<f64> {
        match self.buffers.get(station) {
            Some(entry) => entry
                .read()
                .expect("window buffer lock poisoned")
                .snapshot(),
            None => Vec::new(),
        }
    }

    pub fn station_count(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_before_first_wrap_returns_partial_prefix() {
        let mut buf = WindowBuffer::new(1000);
        buf.write(&vec![1.0; 100]);
        assert_eq!(buf.snapshot().len(), 100);
    }

    #[test]
    fn buffer_wrap_preserves_last_capacity_samples() {
        // capacity 1000, write 1500 samples across 16 packets.
        let mut buf = WindowBuffer::new(1000);
        let mut remaining = 1500;
        let mut next_value = 0.0_f64;
        let mut written = Vec::new();
        let mut packet = 0;
        while remaining > 0 && packet < 16 {
            let chunk_len = (remaining / (16 - packet)).max(1).min(remaining);
            let chunk: Vec<f64> = (0..chunk_len)
                .map(|_| {
                    next_value += 1.0;
                    next_value
                })
                .collect();
            written.extend_from_slice(&chunk);
            buf.write(&chunk);
            remaining -= chunk_len;
            packet += 1;
        }
        assert_eq!(written.len(), 1500);
        let expected = &written[written.len() - 1000..];
        assert_eq!(buf.snapshot(), expected);
        assert_eq!(buf.write_idx(), 500);
    }

    #[test]
    fn overwrite_when_chunk_exceeds_capacity() {
        let mut buf = WindowBuffer::new(100);
        let arr: Vec<f64> = (0..250).map(|i| i as f64).collect();
        buf.write(&arr);
        assert_eq!(buf.write_idx(), 0);
        assert_eq!(buf.snapshot(), &arr[150..]);
    }

    #[test]
    fn window_store_creates_buffer_on_first_write() {
        let store = WindowStore::new(10, 100);
        assert_eq!(store.station_count(), 0);
        store.write("STA01", &vec![1.0; 50]);
        assert_eq!(store.station_count(), 1);
        assert_eq!(store.snapshot("STA01").len(), 50);
        assert!(store.snapshot("STA02").is_empty());
    }
}
