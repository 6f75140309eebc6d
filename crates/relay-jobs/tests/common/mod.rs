//! Shared helpers for the relay-jobs integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Let spawned tasks run without advancing the clock.
pub async fn drain() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Advance the paused clock by `ms`, letting tasks run on the way.
pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    drain().await;
}

/// Tracks how many jobs run at once, globally and per group.
#[derive(Default)]
pub struct ConcurrencyTracker {
    inner: Mutex<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    active: usize,
    max_active: usize,
    groups: HashMap<String, usize>,
    max_groups: HashMap<String, usize>,
    started: Vec<String>,
}

impl ConcurrencyTracker {
    pub fn enter(&self, group: &str, label: &str) {
        let mut state = self.inner.lock();
        state.active += 1;
        state.max_active = state.max_active.max(state.active);
        let count = {
            let count = state.groups.entry(group.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let max = state.max_groups.entry(group.to_string()).or_insert(0);
        *max = (*max).max(count);
        state.started.push(label.to_string());
    }

    pub fn exit(&self, group: &str) {
        let mut state = self.inner.lock();
        state.active -= 1;
        if let Some(count) = state.groups.get_mut(group) {
            *count -= 1;
        }
    }

    pub fn max_active(&self) -> usize {
        self.inner.lock().max_active
    }

    pub fn max_in_group(&self, group: &str) -> usize {
        self.inner.lock().max_groups.get(group).copied().unwrap_or(0)
    }

    pub fn started(&self) -> Vec<String> {
        self.inner.lock().started.clone()
    }
}
