//! Named stopwatches for profiling LSQ training phases

use crate::{Error, Result};
use hashbrown::HashMap;
use std::time::Instant;

/// Accumulates wall-clock time per named phase
///
/// A timer is passed by `&mut` into training; it is never shared with workers.
#[derive(Debug, Default)]
pub struct LsqTimer {
    durations: HashMap<String, f64>,
    t0: HashMap<String, Instant>,
}

impl LsqTimer {
    /// Empty timer
    pub fn new() -> Self {
        Self::default()
    }

    /// Total seconds accumulated for `name`, 0 when never recorded
    pub fn get(&self, name: &str) -> f64 {
        self.durations.get(name).copied().unwrap_or(0.0)
    }

    /// Start timing `name`; fails if it is already running
    pub fn start(&mut self, name: &str) -> Result<()> {
        if self.t0.contains_key(name) {
            return Err(Error::InvalidParameter(format!("timer '{}' already started", name)).into());
        }
        self.t0.insert(name.to_string(), Instant::now());
        Ok(())
    }

    /// Stop timing `name` and add the elapsed time; fails if it was not started
    pub fn end(&mut self, name: &str) -> Result<()> {
        let t0 = self
            .t0
            .remove(name)
            .ok_or_else(|| Error::InvalidParameter(format!("timer '{}' was not started", name)))?;
        *self.durations.entry(name.to_string()).or_insert(0.0) += t0.elapsed().as_secs_f64();
        Ok(())
    }

    /// Whether `name` is currently running
    pub fn is_running(&self, name: &str) -> bool {
        self.t0.contains_key(name)
    }

    /// Stop every running stopwatch, keeping the time accumulated so far
    pub fn end_all(&mut self) {
        for (name, t0) in self.t0.drain() {
            *self.durations.entry(name).or_insert(0.0) += t0.elapsed().as_secs_f64();
        }
    }

    /// Forget every recorded duration and running stopwatch
    pub fn reset(&mut self) {
        self.durations.clear();
        self.t0.clear();
    }

    /// Recorded phase names with their totals, sorted by name
    pub fn summary(&self) -> Vec<(String, f64)> {
        let mut entries: Vec<(String, f64)> = self.durations.iter().map(|(k, &v)| (k.clone(), v)).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
