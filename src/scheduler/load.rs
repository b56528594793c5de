//! Host load sampling for dispatch admission control.
//!
//! `LoadMonitor` is the policy seam the dispatcher consults before each
//! fetch. Three policies ship with the crate:
//!
//! - `SystemLoadMonitor`: 1-minute load average per CPU and used memory from `/proc`
//! - `QueueDepthMonitor`: size of the processing list
//! - `StaticLoadMonitor`: a switch, for tests and embedding

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::queue::QueueManager;

/// Percent thresholds above which the host counts as overloaded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LoadThresholds {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

impl Default for LoadThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 80.0,
            memory_percent: 85.0,
        }
    }
}

/// One load sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub overloaded: bool,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    /// Why the sample is considered overloaded.
    pub reason: Option<String>,
}

impl LoadReport {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn overloaded(reason: impl Into<String>) -> Self {
        Self {
            overloaded: true,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// Source of the overloaded/ok verdict.
#[async_trait]
pub trait LoadMonitor: Send + Sync {
    async fn check_server_load(&self) -> LoadReport;
}

/// Samples `/proc/loadavg` and `/proc/meminfo`.
///
/// A host where either file cannot be read is never reported overloaded.
#[derive(Debug, Clone)]
pub struct SystemLoadMonitor {
    thresholds: LoadThresholds,
    cpus: usize,
}

impl SystemLoadMonitor {
    pub fn new(thresholds: LoadThresholds) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self { thresholds, cpus }
    }

    pub fn thresholds(&self) -> LoadThresholds {
        self.thresholds
    }

    fn evaluate(&self, cpu_percent: f64, memory_percent: f64) -> LoadReport {
        let mut report = LoadReport {
            overloaded: false,
            cpu_percent,
            memory_percent,
            reason: None,
        };
        if cpu_percent > self.thresholds.cpu_percent {
            report.overloaded = true;
            report.reason = Some(format!(
                "CPU load {:.1}% above {:.1}%",
                cpu_percent, self.thresholds.cpu_percent
            ));
        } else if memory_percent > self.thresholds.memory_percent {
            report.overloaded = true;
            report.reason = Some(format!(
                "Memory usage {:.1}% above {:.1}%",
                memory_percent, self.thresholds.memory_percent
            ));
        }
        report
    }
}

impl Default for SystemLoadMonitor {
    fn default() -> Self {
        Self::new(LoadThresholds::default())
    }
}

#[async_trait]
impl LoadMonitor for SystemLoadMonitor {
    async fn check_server_load(&self) -> LoadReport {
        let loadavg = tokio::fs::read_to_string("/proc/loadavg").await;
        let meminfo = tokio::fs::read_to_string("/proc/meminfo").await;

        let (Ok(loadavg), Ok(meminfo)) = (loadavg, meminfo) else {
            debug!("Host load files unavailable, assuming not overloaded");
            return LoadReport::ok();
        };

        let cpu_percent = parse_loadavg(&loadavg)
            .map(|load| load / self.cpus as f64 * 100.0)
            .unwrap_or(0.0);
        let memory_percent = parse_memory_percent(&meminfo).unwrap_or(0.0);

        self.evaluate(cpu_percent, memory_percent)
    }
}

/// Parses the 1-minute load average from `/proc/loadavg`.
pub fn parse_loadavg(contents: &str) -> Option<f64> {
    contents.split_whitespace().next()?.parse().ok()
}

/// Parses used memory percent from `/proc/meminfo`.
///
/// Prefers `MemAvailable`, falling back to `MemFree` on old kernels.
pub fn parse_memory_percent(contents: &str) -> Option<f64> {
    let mut total = None;
    let mut available = None;
    let mut free = None;

    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        let (Some(name), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let value = value.parse::<u64>().ok();
        match name {
            "MemTotal:" => total = value,
            "MemAvailable:" => available = value,
            "MemFree:" => free = value,
            _ => {}
        }
    }

    let total = total.filter(|t| *t > 0)?;
    let available = available.or(free)?;
    let used = total.saturating_sub(available);
    Some(used as f64 / total as f64 * 100.0)
}

/// Reports overload once the processing list grows past a limit.
pub struct QueueDepthMonitor {
    queue: Arc<QueueManager>,
    max_processing: usize,
}

impl QueueDepthMonitor {
    pub fn new(queue: Arc<QueueManager>, max_processing: usize) -> Self {
        Self {
            queue,
            max_processing,
        }
    }
}

#[async_trait]
impl LoadMonitor for QueueDepthMonitor {
    async fn check_server_load(&self) -> LoadReport {
        match self.queue.processing_len().await {
            Ok(depth) if depth > self.max_processing => LoadReport::overloaded(format!(
                "{} jobs in processing, limit {}",
                depth, self.max_processing
            )),
            Ok(_) => LoadReport::ok(),
            Err(e) => {
                debug!(error = %e, "Could not read processing depth");
                LoadReport::ok()
            }
        }
    }
}

/// A monitor whose verdict is set by hand.
#[derive(Debug, Default)]
pub struct StaticLoadMonitor {
    overloaded: AtomicBool,
}

impl StaticLoadMonitor {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn overloaded() -> Self {
        Self {
            overloaded: AtomicBool::new(true),
        }
    }

    pub fn set_overloaded(&self, overloaded: bool) {
        self.overloaded.store(overloaded, Ordering::SeqCst);
    }
}

#[async_trait]
impl LoadMonitor for StaticLoadMonitor {
    async fn check_server_load(&self) -> LoadReport {
        if self.overloaded.load(Ordering::SeqCst) {
            LoadReport::overloaded("forced overload")
        } else {
            LoadReport::ok()
        }
    }
}
