//! Pipeline performance monitoring.
//!
//! Stages are timed with [`PerformanceMonitor::start`] and
//! [`StageTimer::stop`]; recording a sample returns any budget violations.
//! The monitor never acts on violations itself.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Samples kept per stage and key.
pub const DEFAULT_WINDOW: usize = 100;

/// Relative change between window halves that counts as a trend.
const TREND_THRESHOLD: f64 = 0.20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Compile,
    Execute,
    Initialize,
    Validate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Compile => "compile",
            Stage::Execute => "execute",
            Stage::Initialize => "initialize",
            Stage::Validate => "validate",
        })
    }
}

/// Ceilings the monitor checks samples against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceBudget {
    pub compile_ms: u64,
    pub validate_ms: u64,
    /// Applies to both execution and initialization.
    pub execute_ms: u64,
    pub memory_bytes: usize,
}

impl Default for PerformanceBudget {
    fn default() -> Self {
        Self {
            compile_ms: 500,
            validate_ms: 250,
            execute_ms: 100,
            memory_bytes: 64 * 1024 * 1024,
        }
    }
}

impl PerformanceBudget {
    pub fn time_for(&self, stage: Stage) -> Duration {
        Duration::from_millis(match stage {
            Stage::Compile => self.compile_ms,
            Stage::Validate => self.validate_ms,
            Stage::Execute | Stage::Initialize => self.execute_ms,
        })
    }
}

/// One measured stage run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSample {
    pub stage: Stage,
    /// Mod or script the sample belongs to.
    pub key: String,
    pub duration: Duration,
    pub memory_bytes: usize,
    /// Bytes allocated and released during the stage.
    pub gc_churn: usize,
}

/// Running measurement returned by [`PerformanceMonitor::start`].
#[derive(Debug)]
pub struct StageTimer {
    stage: Stage,
    key: String,
    started: Instant,
}

impl StageTimer {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn stop(self, memory_bytes: usize) -> StageSample {
        StageSample {
            stage: self.stage,
            key: self.key,
            duration: self.started.elapsed(),
            memory_bytes,
            gc_churn: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Time,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Over budget.
    Warning,
    /// Over twice the budget.
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetViolation {
    pub stage: Stage,
    pub key: String,
    pub metric: Metric,
    pub severity: ViolationSeverity,
    /// Milliseconds for time, bytes for memory.
    pub observed: u64,
    pub budget: u64,
}

impl fmt::Display for BudgetViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.metric {
            Metric::Time => "ms",
            Metric::Memory => "bytes",
        };
        write!(
            f,
            "{} {} for '{}': {} {} over budget of {} {}",
            self.stage,
            match self.metric {
                Metric::Time => "time",
                Metric::Memory => "memory",
            },
            self.key,
            self.observed,
            unit,
            self.budget,
            unit
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

/// Summary of one stage and key over the rolling window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStatistics {
    pub count: usize,
    pub mean: Duration,
    pub p95: Duration,
    pub max: Duration,
    pub peak_memory: usize,
    pub total_gc_churn: usize,
    pub trend: Trend,
}

fn classify(observed: u64, budget: u64) -> Option<ViolationSeverity> {
    if budget == 0 || observed <= budget {
        None
    } else if observed > budget.saturating_mul(2) {
        Some(ViolationSeverity::Critical)
    } else {
        Some(ViolationSeverity::Warning)
    }
}

fn trend(durations: &[Duration]) -> Trend {
    if durations.len() < 4 {
        return Trend::Stable;
    }
    let half = durations.len() / 2;
    let mean = |d: &[Duration]| d.iter().map(Duration::as_secs_f64).sum::<f64>() / d.len() as f64;
    let older = mean(&durations[..half]);
    let newer = mean(&durations[half..]);
    if older == 0.0 {
        return Trend::Stable;
    }
    let change = (newer - older) / older;
    if change > TREND_THRESHOLD {
        Trend::Degrading
    } else if change < -TREND_THRESHOLD {
        Trend::Improving
    } else {
        Trend::Stable
    }
}

/// Observes pipeline stages per mod or script.
#[derive(Debug)]
pub struct PerformanceMonitor {
    budget: PerformanceBudget,
    window: usize,
    history: Mutex<HashMap<(Stage, String), VecDeque<StageSample>>>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(PerformanceBudget::default())
    }
}

impl PerformanceMonitor {
    pub fn new(budget: PerformanceBudget) -> Self {
        Self {
            budget,
            window: DEFAULT_WINDOW,
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    pub fn budget(&self) -> &PerformanceBudget {
        &self.budget
    }

    pub fn start(&self, stage: Stage, key: impl Into<String>) -> StageTimer {
        StageTimer {
            stage,
            key: key.into(),
            started: Instant::now(),
        }
    }

    /// Store a sample and check it against the budget.
    pub fn record(&self, sample: StageSample) -> Vec<BudgetViolation> {
        let mut violations = Vec::new();

        let time_budget = self.budget.time_for(sample.stage).as_millis() as u64;
        let observed_ms = sample.duration.as_millis() as u64;
        if let Some(severity) = classify(observed_ms, time_budget) {
            violations.push(BudgetViolation {
                stage: sample.stage,
                key: sample.key.clone(),
                metric: Metric::Time,
                severity,
                observed: observed_ms,
                budget: time_budget,
            });
        }

        let memory_budget = self.budget.memory_bytes as u64;
        if let Some(severity) = classify(sample.memory_bytes as u64, memory_budget) {
            violations.push(BudgetViolation {
                stage: sample.stage,
                key: sample.key.clone(),
                metric: Metric::Memory,
                severity,
                observed: sample.memory_bytes as u64,
                budget: memory_budget,
            });
        }

        for violation in &violations {
            warn!(severity = ?violation.severity, "Budget violation: {}", violation);
        }
        debug!(
            stage = %sample.stage,
            key = %sample.key,
            elapsed_ms = observed_ms,
            "Recorded stage sample"
        );

        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let samples = history
            .entry((sample.stage, sample.key.clone()))
            .or_default();
        if samples.len() == self.window {
            samples.pop_front();
        }
        samples.push_back(sample);

        violations
    }

    pub fn statistics(&self, stage: Stage, key: &str) -> Option<StageStatistics> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let samples = history.get(&(stage, key.to_string()))?;
        if samples.is_empty() {
            return None;
        }

        let durations: Vec<Duration> = samples.iter().map(|s| s.duration).collect();
        let mut sorted = durations.clone();
        sorted.sort();
        let count = sorted.len();
        let p95_index = ((count as f64 * 0.95).ceil() as usize).clamp(1, count) - 1;

        Some(StageStatistics {
            count,
            mean: durations.iter().sum::<Duration>() / count as u32,
            p95: sorted[p95_index],
            max: sorted[count - 1],
            peak_memory: samples.iter().map(|s| s.memory_bytes).max().unwrap_or(0),
            total_gc_churn: samples.iter().map(|s| s.gc_churn).sum(),
            trend: trend(&durations),
        })
    }

    /// Every stage and key with samples, sorted.
    pub fn keys(&self) -> Vec<(Stage, String)> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<_> = history.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Drop all history for a key and for keys scoped under it
    /// (`key/...`, as script ids are under their mod id).
    pub fn forget(&self, key: &str) {
        let scope = format!("{}/", key);
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(_, k), _| k != key && !k.starts_with(&scope));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(stage: Stage, ms: u64, memory: usize) -> StageSample {
        StageSample {
            stage,
            key: "demo".to_string(),
            duration: Duration::from_millis(ms),
            memory_bytes: memory,
            gc_churn: 10,
        }
    }

    #[test]
    fn test_violation_severity() {
        let monitor = PerformanceMonitor::new(PerformanceBudget {
            compile_ms: 100,
            validate_ms: 100,
            execute_ms: 100,
            memory_bytes: 1000,
        });
        assert!(monitor.record(sample(Stage::Execute, 100, 1000)).is_empty());

        let warning = monitor.record(sample(Stage::Execute, 150, 0));
        assert_eq!(warning.len(), 1);
        assert_eq!(warning[0].severity, ViolationSeverity::Warning);

        let critical = monitor.record(sample(Stage::Compile, 201, 2001));
        assert_eq!(critical.len(), 2);
        assert!(critical.iter().all(|v| v.severity == ViolationSeverity::Critical));
        assert_eq!(critical[1].metric, Metric::Memory);
    }

    #[test]
    fn test_rolling_window_and_statistics() {
        let monitor = PerformanceMonitor::default().with_window(20);
        for ms in 1..=25 {
            monitor.record(sample(Stage::Execute, ms, ms as usize));
        }
        let stats = monitor.statistics(Stage::Execute, "demo").unwrap();
        assert_eq!(stats.count, 20);
        assert_eq!(stats.max, Duration::from_millis(25));
        assert_eq!(stats.p95, Duration::from_millis(24));
        assert_eq!(stats.peak_memory, 25);
        assert_eq!(stats.total_gc_churn, 200);
        assert!(monitor.statistics(Stage::Compile, "demo").is_none());
    }

    #[test]
    fn test_trend() {
        let monitor = PerformanceMonitor::default();
        for ms in [10, 10, 10, 10, 20, 20, 20, 20] {
            monitor.record(sample(Stage::Initialize, ms, 0));
        }
        assert_eq!(monitor.statistics(Stage::Initialize, "demo").unwrap().trend, Trend::Degrading);

        let steady = PerformanceMonitor::default();
        for ms in [10, 11, 10, 11] {
            steady.record(sample(Stage::Validate, ms, 0));
        }
        assert_eq!(steady.statistics(Stage::Validate, "demo").unwrap().trend, Trend::Stable);
    }

    #[test]
    fn test_timer_and_forget() {
        let monitor = PerformanceMonitor::default();
        let timer = monitor.start(Stage::Validate, "demo");
        let sample = timer.stop(64);
        assert_eq!(sample.stage, Stage::Validate);
        monitor.record(sample);
        assert_eq!(monitor.keys(), vec![(Stage::Validate, "demo".to_string())]);
        monitor.forget("demo");
        assert!(monitor.keys().is_empty());
    }

    #[test]
    fn test_forget_drops_script_scoped_keys() {
        let monitor = PerformanceMonitor::default();
        for key in ["demo", "demo/main.lua", "demo/util/math.lua", "demonic/main.lua"] {
            monitor.record(StageSample {
                key: key.to_string(),
                ..sample(Stage::Compile, 1, 0)
            });
        }
        monitor.forget("demo");
        assert_eq!(monitor.keys(), vec![(Stage::Compile, "demonic/main.lua".to_string())]);
    }
}
