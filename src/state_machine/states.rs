//! State data of the pipeline lifecycle
//!
//! Each state carries the timestamps collected up to that point.

use chrono::{DateTime, Utc};

/// Modules may still be attached
#[derive(Debug, Clone, Default)]
pub struct Uninitialized;

/// Every module has been configured
#[derive(Debug, Clone)]
pub struct Initialized {
    pub initialized_at: DateTime<Utc>,
}

/// Cycles are being drained
#[derive(Debug, Clone)]
pub struct Running {
    pub initialized_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

/// Finish hooks ran; the pipeline cannot be used again
#[derive(Debug, Clone)]
pub struct Drained {
    pub finished_at: DateTime<Utc>,

    /// Completed cycles
    pub cycles: u64,

    /// Whether the run ended without an error
    pub success: bool,
}

impl Initialized {
    pub fn new() -> Self {
        Self {
            initialized_at: Utc::now(),
        }
    }
}

impl Default for Initialized {
    fn default() -> Self {
        Self::new()
    }
}

impl Running {
    pub fn from_initialized(initialized: &Initialized) -> Self {
        Self {
            initialized_at: initialized.initialized_at,
            started_at: Utc::now(),
        }
    }

    /// Time spent draining so far
    pub fn duration(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }
}

impl Drained {
    pub fn new(cycles: u64, success: bool) -> Self {
        Self {
            finished_at: Utc::now(),
            cycles,
            success,
        }
    }
}
