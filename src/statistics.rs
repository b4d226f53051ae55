use crate::system::{peak_memory_mb, Timer};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// Default number of samples kept per series
pub const STATS_LIMIT: usize = 100_000;

/// One timing measurement
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    /// Zero-based cycle index
    pub cycle: u64,
    pub wall: Duration,
    pub cpu: Duration,
}

/// Mean, median, min, max and standard deviation of a series, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub std: f64,
}

impl Summary {
    /// Summarize a series; `None` for an empty one
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let n = values.len() as f64;
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let mean = sorted.iter().sum::<f64>() / n;
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };
        let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

        Some(Self {
            mean,
            median,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            std: variance.sqrt(),
        })
    }
}

/// Sliding window of samples plus exact running totals
#[derive(Debug, Clone)]
struct SampleWindow {
    samples: VecDeque<Sample>,
    limit: usize,
    count: u64,
    total_wall: Duration,
    total_cpu: Duration,
}

impl SampleWindow {
    fn new(limit: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            limit,
            count: 0,
            total_wall: Duration::ZERO,
            total_cpu: Duration::ZERO,
        }
    }

    fn record(&mut self, sample: Sample) {
        if self.limit > 0 && self.samples.len() >= self.limit {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.count += 1;
        self.total_wall += sample.wall;
        self.total_cpu += sample.cpu;
    }

    fn wall_summary(&self) -> Option<Summary> {
        let values: Vec<f64> = self.samples.iter().map(|s| s.wall.as_secs_f64()).collect();
        Summary::from_values(&values)
    }

    fn cpu_summary(&self) -> Option<Summary> {
        let values: Vec<f64> = self.samples.iter().map(|s| s.cpu.as_secs_f64()).collect();
        Summary::from_values(&values)
    }
}

#[derive(Debug, Clone)]
struct ModuleSeries {
    name: String,
    timeit: bool,
    window: SampleWindow,
    finish_wall: Duration,
    finish_cpu: Duration,
}

/// Collects wall-clock and CPU samples for every module and every cycle
#[derive(Debug, Clone)]
pub struct StatisticsCollector {
    limit: usize,
    run_timer: Option<Timer>,
    modules: Vec<ModuleSeries>,
    cycles: SampleWindow,
}

impl StatisticsCollector {
    /// Create a collector keeping at most `limit` samples per series (0 = unbounded)
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            run_timer: None,
            modules: Vec::new(),
            cycles: SampleWindow::new(limit),
        }
    }

    /// Add a series for a module; returns its index
    pub fn register_module(&mut self, name: impl Into<String>, timeit: bool) -> usize {
        self.modules.push(ModuleSeries {
            name: name.into(),
            timeit,
            window: SampleWindow::new(self.limit),
            finish_wall: Duration::ZERO,
            finish_cpu: Duration::ZERO,
        });
        self.modules.len() - 1
    }

    /// Start the run-wide wall/CPU clock
    pub fn start_run(&mut self) {
        self.run_timer = Some(Timer::start());
    }

    pub fn record_module(&mut self, index: usize, cycle: u64, wall: Duration, cpu: Duration) {
        if let Some(series) = self.modules.get_mut(index) {
            series.window.record(Sample { cycle, wall, cpu });
        }
    }

    pub fn record_cycle(&mut self, cycle: u64, wall: Duration, cpu: Duration) {
        self.cycles.record(Sample { cycle, wall, cpu });
    }

    pub fn record_finish(&mut self, index: usize, wall: Duration, cpu: Duration) {
        if let Some(series) = self.modules.get_mut(index) {
            series.finish_wall = wall;
            series.finish_cpu = cpu;
        }
    }

    /// Retained samples of a module, oldest first
    pub fn samples(&self, index: usize) -> Vec<Sample> {
        self.modules
            .get(index)
            .map(|series| series.window.samples.iter().copied().collect())
            .unwrap_or_default()
    }

    /// How many times a module's process step ran
    pub fn invocations(&self, index: usize) -> u64 {
        self.modules.get(index).map(|s| s.window.count).unwrap_or(0)
    }

    /// Compute the aggregated report
    pub fn finalize(&self, cycles: u64) -> StatisticsReport {
        let (total_wall, total_cpu) = self
            .run_timer
            .map(|timer| timer.stop())
            .unwrap_or((Duration::ZERO, Duration::ZERO));

        let modules = self
            .modules
            .iter()
            .map(|series| ModuleStatistics {
                name: series.name.clone(),
                timeit: series.timeit,
                invocations: series.window.count,
                samples: series.window.samples.len(),
                total_wall: series.window.total_wall,
                total_cpu: series.window.total_cpu,
                finish_wall: series.finish_wall,
                finish_cpu: series.finish_cpu,
                wall: series.window.wall_summary(),
                cpu: series.window.cpu_summary(),
            })
            .collect();

        StatisticsReport {
            cycles,
            total_wall,
            total_cpu,
            peak_memory_mb: peak_memory_mb(),
            cycle_samples: self.cycles.samples.len(),
            cycle_wall: self.cycles.wall_summary(),
            cycle_cpu: self.cycles.cpu_summary(),
            modules,
        }
    }
}

impl Default for StatisticsCollector {
    fn default() -> Self {
        Self::new(STATS_LIMIT)
    }
}

/// Timing statistics of one module
#[derive(Debug, Clone, Serialize)]
pub struct ModuleStatistics {
    pub name: String,
    pub timeit: bool,
    pub invocations: u64,
    /// Samples retained for the summaries (capped by the stats limit)
    pub samples: usize,
    pub total_wall: Duration,
    pub total_cpu: Duration,
    pub finish_wall: Duration,
    pub finish_cpu: Duration,
    /// `None` when the module never ran
    pub wall: Option<Summary>,
    pub cpu: Option<Summary>,
}

/// Read-only statistics of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct StatisticsReport {
    pub cycles: u64,
    pub total_wall: Duration,
    pub total_cpu: Duration,
    pub peak_memory_mb: Option<f64>,
    pub cycle_samples: usize,
    pub cycle_wall: Option<Summary>,
    pub cycle_cpu: Option<Summary>,
    pub modules: Vec<ModuleStatistics>,
}

impl StatisticsReport {
    /// Statistics of the first module attached under `name`
    pub fn module(&self, name: &str) -> Option<&ModuleStatistics> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Per-module lines; `all` includes modules without `timeit`
    pub fn module_table(&self, all: bool) -> String {
        let mut lines = Vec::new();
        for module in self.modules.iter().filter(|m| all || m.timeit) {
            lines.push(format!(
                "{} - process: {:.3}s (CPU {:.3}s) - finish: {:.3}s (CPU {:.3}s)",
                module.name,
                module.total_wall.as_secs_f64(),
                module.total_cpu.as_secs_f64(),
                module.finish_wall.as_secs_f64(),
                module.finish_cpu.as_secs_f64()
            ));
            match (&module.wall, &module.cpu) {
                (Some(wall), Some(cpu)) => {
                    lines.push(format_summary("wall", wall));
                    lines.push(format_summary("CPU ", cpu));
                }
                _ => lines.push("  no data".to_string()),
            }
        }
        lines.join("\n")
    }
}

/// Seconds, switching to minutes above three minutes
fn format_time(seconds: f64) -> String {
    if seconds > 180.0 {
        format!("{:.6}min", seconds / 60.0)
    } else {
        format!("{:.6}s", seconds)
    }
}

fn format_summary(prefix: &str, summary: &Summary) -> String {
    format!(
        "  {}  mean: {}  medi: {}  min: {}  max: {}  std: {}",
        prefix,
        format_time(summary.mean),
        format_time(summary.median),
        format_time(summary.min),
        format_time(summary.max),
        format_time(summary.std)
    )
}

impl fmt::Display for StatisticsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cycles == 0 {
            return write!(
                f,
                "No cycles drained in {} (CPU {}).",
                format_time(self.total_wall.as_secs_f64()),
                format_time(self.total_cpu.as_secs_f64())
            );
        }

        let memory = self
            .peak_memory_mb
            .map(|mb| format!("{:.2} MB", mb))
            .unwrap_or_else(|| "unknown".to_string());
        write!(
            f,
            "{} cycles drained in {} (CPU {}). Memory peak: {}",
            self.cycles,
            format_time(self.total_wall.as_secs_f64()),
            format_time(self.total_cpu.as_secs_f64()),
            memory
        )?;
        if (self.cycle_samples as u64) < self.cycles {
            write!(
                f,
                "\nStatistics are based on the last {} cycles.",
                self.cycle_samples
            )?;
        }
        if let Some(wall) = &self.cycle_wall {
            write!(f, "\n{}", format_summary("wall", wall))?;
        }
        if let Some(cpu) = &self.cycle_cpu {
            write!(f, "\n{}", format_summary("CPU ", cpu))?;
        }
        Ok(())
    }
}
