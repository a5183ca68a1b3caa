//! Resource monitor emitter: samples CPU, memory, and disk on a tick and
//! emits threshold-crossing events with a per-kind cooldown.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use alfred_protocol::{Event, Params};

use crate::stats::{self, CpuSampler};

use super::{Emitter, Manager};

const CHECK_INTERVAL: Duration = Duration::from_secs(30);
const ALERT_COOLDOWN: Duration = Duration::from_secs(5 * 60);

const CPU_THRESHOLD: f64 = 80.0;
const MEM_THRESHOLD: f64 = 85.0;
const DISK_THRESHOLD: f64 = 90.0;

pub struct ResourceMonitor {
    source: String,
    check_interval: Duration,
    cpu_threshold: f64,
    mem_threshold: f64,
    disk_threshold: f64,
    cooldown: Duration,
    state: Mutex<MonitorState>,
}

#[derive(Default)]
struct MonitorState {
    sampler: CpuSampler,
    last_alert: HashMap<&'static str, Instant>,
}

impl MonitorState {
    /// True when `kind` may alert now; records the alert time when it may.
    fn should_alert(&mut self, kind: &'static str, now: Instant, cooldown: Duration) -> bool {
        match self.last_alert.get(kind) {
            Some(last) if now.duration_since(*last) < cooldown => false,
            _ => {
                self.last_alert.insert(kind, now);
                true
            }
        }
    }
}

impl ResourceMonitor {
    pub fn new(daemon_name: &str) -> Self {
        Self {
            source: format!("daemon:{daemon_name}"),
            check_interval: CHECK_INTERVAL,
            cpu_threshold: CPU_THRESHOLD,
            mem_threshold: MEM_THRESHOLD,
            disk_threshold: DISK_THRESHOLD,
            cooldown: ALERT_COOLDOWN,
            state: Mutex::new(MonitorState::default()),
        }
    }

    #[cfg(test)]
    fn with_limits(daemon_name: &str, cpu: f64, mem: f64, disk: f64, cooldown: Duration) -> Self {
        let mut monitor = Self::new(daemon_name);
        monitor.cpu_threshold = cpu;
        monitor.mem_threshold = mem;
        monitor.disk_threshold = disk;
        monitor.cooldown = cooldown;
        monitor
    }

    fn check(&self, manager: &Manager) {
        let now = Instant::now();
        let cpu = { self.state.lock().unwrap().sampler.sample() };
        let mem = stats::memory_percent();
        let disk = stats::disk_percent(Path::new("/"));

        for (kind, value, threshold) in [
            ("cpu_high", cpu, self.cpu_threshold),
            ("memory_high", mem, self.mem_threshold),
            ("disk_high", disk, self.disk_threshold),
        ] {
            if value <= threshold {
                continue;
            }
            let fire = self
                .state
                .lock()
                .unwrap()
                .should_alert(kind, now, self.cooldown);
            if fire {
                warn!(kind, percent = value, threshold, "resource threshold crossed");
                let mut payload = Params::new();
                payload.insert("percent".into(), json!(value));
                payload.insert("threshold".into(), json!(threshold));
                manager.emit(Event::now(self.source.clone(), kind, payload));
            }
        }
    }
}

impl Emitter for ResourceMonitor {
    fn name(&self) -> &'static str {
        "resource_monitor"
    }

    fn run(
        self: Arc<Self>,
        manager: Arc<Manager>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let mut ticker = tokio::time::interval(self.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick primes the CPU sampler.
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => self.check(&manager),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Cooldown
    // -----------------------------------------------------------------------

    #[test]
    fn cooldown_limits_one_alert_per_window() {
        let mut state = MonitorState::default();
        let cooldown = Duration::from_secs(300);
        let t0 = Instant::now();

        assert!(state.should_alert("cpu_high", t0, cooldown));
        assert!(!state.should_alert("cpu_high", t0 + Duration::from_secs(60), cooldown));
        assert!(state.should_alert("cpu_high", t0 + Duration::from_secs(301), cooldown));
    }

    #[test]
    fn cooldown_is_tracked_per_kind() {
        let mut state = MonitorState::default();
        let cooldown = Duration::from_secs(300);
        let t0 = Instant::now();

        assert!(state.should_alert("cpu_high", t0, cooldown));
        assert!(state.should_alert("memory_high", t0, cooldown));
        assert!(!state.should_alert("cpu_high", t0, cooldown));
    }

    // -----------------------------------------------------------------------
    // Threshold checks
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn impossible_thresholds_never_emit() {
        let manager = Manager::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        manager.on_event(move |event| {
            let _ = tx.send(event);
        });

        let monitor =
            ResourceMonitor::with_limits("test", 200.0, 200.0, 200.0, Duration::from_secs(1));
        monitor.check(&manager);

        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn zero_disk_threshold_emits_once_per_cooldown() {
        let manager = Manager::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        manager.on_event(move |event| {
            let _ = tx.send(event);
        });

        // Any real filesystem has more than -1% disk usage.
        let monitor =
            ResourceMonitor::with_limits("test", 200.0, 200.0, -1.0, Duration::from_secs(600));
        monitor.check(&manager);
        monitor.check(&manager);

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, "disk_high");
        assert_eq!(event.source, "daemon:test");
        assert!(event.payload.contains_key("percent"));

        // The second check fell inside the cooldown window.
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
