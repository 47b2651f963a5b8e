use crate::cache::CacheStats;
use crate::cycle::{CycleReport, CycleSummary};
use crate::query::QueryCache;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub cycles_run: u64,
    pub memory_usage_mb: f32,
    pub last_cycle: Option<CycleSummary>,
    pub cache: Option<CacheStats>,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    cycles_run: Arc<AtomicU64>,
    last_cycle: Arc<parking_lot::Mutex<Option<CycleSummary>>>,
    cache: Option<Arc<QueryCache>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            cycles_run: Arc::new(AtomicU64::new(0)),
            last_cycle: Arc::new(parking_lot::Mutex::new(None)),
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<QueryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn record_cycle(&self, report: &CycleReport) {
        self.cycles_run.fetch_add(1, Ordering::Relaxed);
        *self.last_cycle.lock() = Some(report.summary());
    }

    pub fn get_health(&self) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            cycles_run: self.cycles_run.load(Ordering::Relaxed),
            memory_usage_mb: get_memory_usage_mb(),
            last_cycle: self.last_cycle.lock().clone(),
            cache: self.cache.as_ref().map(|c| c.stats()),
        }
    }

    pub fn log_health(&self) {
        let health = self.get_health();
        match serde_json::to_string(&health) {
            Ok(payload) => info!(
                uptime_secs = health.uptime_seconds,
                cycles = health.cycles_run,
                health = %payload,
                "kernel health"
            ),
            Err(e) => warn!(error = %e, "health serialization failed"),
        }
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let kb = status
                .lines()
                .find(|l| l.starts_with("VmRSS:"))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|v| v.parse::<u64>().ok());
            if let Some(kb) = kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlCache;
    use crate::cycle::{HostOutcome, OutcomeStatus};
    use chrono::Utc;
    use std::time::Duration;
    use uuid::Uuid;

    fn report(done: usize, failed: usize) -> CycleReport {
        let outcome = |i: usize, status| HostOutcome {
            host: format!("h{i}"),
            status,
            probe_attempts: 1,
            store_attempts: 1,
            users_stored: 0,
            elapsed_ms: 10,
            failure: None,
        };
        let mut outcomes: Vec<_> = (0..done).map(|i| outcome(i, OutcomeStatus::Done)).collect();
        outcomes.extend((done..done + failed).map(|i| outcome(i, OutcomeStatus::Failed)));
        CycleReport {
            cycle_id: Uuid::new_v4(),
            started_at: Utc::now(),
            duration: Duration::from_secs(4),
            deadline_hit: false,
            outcomes,
        }
    }

    #[test]
    fn test_health_tracks_cycles() {
        let tracker = HealthTracker::new();
        assert!(tracker.get_health().last_cycle.is_none());

        tracker.record_cycle(&report(3, 1));
        let second = report(1, 3);
        tracker.record_cycle(&second);

        let health = tracker.get_health();
        assert_eq!(health.cycles_run, 2);
        let last = health.last_cycle.unwrap();
        assert_eq!(last.cycle_id, second.cycle_id);
        assert_eq!((last.done, last.failed), (1, 3));
        assert!(health.cache.is_none());
    }

    #[test]
    fn test_health_serializes_with_cache_stats() {
        let cache = Arc::new(TtlCache::new(Duration::from_secs(900)));
        let tracker = HealthTracker::new().with_cache(cache);
        let json = serde_json::to_value(tracker.get_health()).unwrap();
        assert_eq!(json["cycles_run"], 0);
        assert_eq!(json["cache"]["entries"], 0);
        assert!(json["last_cycle"].is_null());
    }
}
