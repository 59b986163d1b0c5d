//! Per-client request admission over a fixed window.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct RateRecord {
    count: u32,
    window_start: Instant,
}

pub struct RateLimiter {
    records: DashMap<String, RateRecord>,
    window: Duration,
    max_per_window: u32,
}

impl RateLimiter {
    pub fn new(window: Duration, max_per_window: u32) -> Self {
        Self {
            records: DashMap::new(),
            window,
            max_per_window,
        }
    }

    pub fn admit(&self, client_id: &str) -> bool {
        self.admit_at(client_id, Instant::now())
    }

    /// The record is counted even when the call is rejected.
    pub fn admit_at(&self, client_id: &str, now: Instant) -> bool {
        let mut record = self
            .records
            .entry(client_id.to_string())
            .or_insert(RateRecord {
                count: 0,
                window_start: now,
            });
        if now.saturating_duration_since(record.window_start) > self.window {
            record.count = 0;
            record.window_start = now;
        }
        record.count = record.count.saturating_add(1);
        record.count <= self.max_per_window
    }

    /// Drops records whose window already elapsed; returns how many went.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, record| now.saturating_duration_since(record.window_start) <= self.window);
        before.saturating_sub(self.records.len())
    }

    pub fn tracked_clients(&self) -> usize {
        self.records.len()
    }
}
