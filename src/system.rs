//! Process measurements used by statistics and provenance: CPU time, peak resident
//! memory, a wall/CPU timer and a snapshot of the host environment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Environment variables worth keeping in a provenance record
const ENV_VARS_TO_LOG: [&str; 12] = [
    "PATH",
    "LD_LIBRARY_PATH",
    "DYLD_LIBRARY_PATH",
    "USER",
    "HOME",
    "SHELL",
    "VIRTUAL_ENV",
    "CONDA_DEFAULT_ENV",
    "CONDA_PREFIX",
    "CONDA_EXE",
    "CONDA_SHLVL",
    "CARGO_TARGET_DIR",
];

/// CI markers, recorded as true/false/other only
const ENV_VARS_IN_CI_TO_LOG: [&str; 8] = [
    "APPVEYOR",
    "CI",
    "CIRCLECI",
    "CONTINUOUS_INTEGRATION",
    "GITHUB_ACTIONS",
    "GITLAB_CI",
    "TF_BUILD",
    "TRAVIS",
];

/// CPU time (user + system) consumed by this process so far
#[cfg(unix)]
pub fn cpu_time() -> Duration {
    match rusage() {
        Some(usage) => timeval_to_duration(usage.ru_utime) + timeval_to_duration(usage.ru_stime),
        None => Duration::ZERO,
    }
}

#[cfg(not(unix))]
pub fn cpu_time() -> Duration {
    Duration::ZERO
}

/// Peak resident set size of this process in MB, if the platform reports it
#[cfg(unix)]
pub fn peak_memory_mb() -> Option<f64> {
    let usage = rusage()?;
    let max_rss = usage.ru_maxrss as f64;
    // Linux reports kilobytes, macOS reports bytes
    if cfg!(target_os = "macos") {
        Some(max_rss / (1024.0 * 1024.0))
    } else {
        Some(max_rss / 1024.0)
    }
}

#[cfg(not(unix))]
pub fn peak_memory_mb() -> Option<f64> {
    None
}

#[cfg(unix)]
fn rusage() -> Option<libc::rusage> {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::uninit();
    // SAFETY: getrusage only writes into the provided struct
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if rc == 0 {
        // SAFETY: a zero return code means the struct was filled in
        Some(unsafe { usage.assume_init() })
    } else {
        None
    }
}

#[cfg(unix)]
fn timeval_to_duration(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

/// Measures wall-clock and CPU time between `start` and `stop`
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    wall_start: Instant,
    cpu_start: Duration,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            wall_start: Instant::now(),
            cpu_start: cpu_time(),
        }
    }

    /// Elapsed `(wall, cpu)` since the timer started
    pub fn stop(&self) -> (Duration, Duration) {
        let wall = self.wall_start.elapsed();
        let cpu = cpu_time().saturating_sub(self.cpu_start);
        (wall, cpu)
    }
}

/// Host and process description attached to the run activity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemInfo {
    pub blobflow_version: String,
    pub executable: Option<String>,
    pub arguments: Vec<String>,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub family: String,
    pub num_cpus: usize,
    pub environment: BTreeMap<String, Option<String>>,
    pub start_time_utc: DateTime<Utc>,
}

impl SystemInfo {
    /// Collect information about the running process and host
    pub fn collect() -> Self {
        let hostname = hostname::get()
            .ok()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|| "Unknown".to_string());

        Self {
            blobflow_version: env!("CARGO_PKG_VERSION").to_string(),
            executable: std::env::current_exe()
                .ok()
                .map(|p| p.to_string_lossy().to_string()),
            arguments: std::env::args().collect(),
            hostname,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            family: std::env::consts::FAMILY.to_string(),
            num_cpus: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            environment: environment(),
            start_time_utc: Utc::now(),
        }
    }
}

/// Selected environment variables, with CI markers reduced to true/false/other
fn environment() -> BTreeMap<String, Option<String>> {
    let mut env: BTreeMap<String, Option<String>> = ENV_VARS_TO_LOG
        .iter()
        .map(|var| (var.to_string(), std::env::var(var).ok()))
        .collect();

    for var in ENV_VARS_IN_CI_TO_LOG {
        env.insert(var.to_string(), mask_ci_value(std::env::var(var).ok()));
    }
    env
}

fn mask_ci_value(value: Option<String>) -> Option<String> {
    let value = value?;
    match value.to_lowercase().as_str() {
        "" => None,
        "true" | "t" | "yes" | "y" | "1" => Some("true".to_string()),
        "false" | "f" | "no" | "n" | "0" => Some("false".to_string()),
        _ => Some("other".to_string()),
    }
}
