//! Lifecycle of a pipeline
//!
//! # States
//!
//! - `Uninitialized` - modules are being attached
//! - `Initialized` - every module has been configured
//! - `Running` - cycles are being drained
//! - `Drained` - finish hooks ran, terminal
//!
//! `Drained` may be reached from any other state so that an aborted
//! initialization still tears down cleanly. Every call on a drained pipeline
//! fails with [`PipeError::AlreadyDrained`].

pub mod states;

pub use states::*;

use crate::error::{PipeError, PipeResult};
use std::fmt;

/// Current lifecycle state together with its data
#[derive(Debug, Clone)]
pub enum PipelineState {
    Uninitialized(Uninitialized),
    Initialized(Initialized),
    Running(Running),
    Drained(Drained),
}

impl PipelineState {
    pub fn new() -> Self {
        Self::Uninitialized(Uninitialized)
    }

    /// Get the current state as a string
    pub fn state_name(&self) -> &'static str {
        match self {
            Self::Uninitialized(_) => "Uninitialized",
            Self::Initialized(_) => "Initialized",
            Self::Running(_) => "Running",
            Self::Drained(_) => "Drained",
        }
    }

    pub fn is_drained(&self) -> bool {
        matches!(self, Self::Drained(_))
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running(_))
    }

    /// Fails unless modules may still be attached
    pub fn ensure_attachable(&self) -> PipeResult<()> {
        match self {
            Self::Uninitialized(_) => Ok(()),
            Self::Drained(_) => Err(PipeError::AlreadyDrained),
            other => Err(PipeError::InvalidStateTransition(format!(
                "Cannot attach modules while {}",
                other.state_name()
            ))),
        }
    }

    /// Transition to Initialized (only from Uninitialized)
    pub fn initialize(&mut self) -> PipeResult<()> {
        match self {
            Self::Uninitialized(_) => {
                *self = Self::Initialized(Initialized::new());
                Ok(())
            }
            Self::Drained(_) => Err(PipeError::AlreadyDrained),
            other => Err(PipeError::InvalidStateTransition(format!(
                "Cannot initialize from {} state",
                other.state_name()
            ))),
        }
    }

    /// Transition to Running (only from Initialized)
    pub fn start(&mut self) -> PipeResult<()> {
        match self {
            Self::Initialized(initialized) => {
                let running = Running::from_initialized(initialized);
                *self = Self::Running(running);
                Ok(())
            }
            Self::Drained(_) => Err(PipeError::AlreadyDrained),
            other => Err(PipeError::InvalidStateTransition(format!(
                "Cannot start draining from {} state",
                other.state_name()
            ))),
        }
    }

    /// Transition to Drained (from any non-terminal state)
    pub fn drain(&mut self, cycles: u64, success: bool) -> PipeResult<()> {
        if self.is_drained() {
            return Err(PipeError::AlreadyDrained);
        }
        *self = Self::Drained(Drained::new(cycles, success));
        Ok(())
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state_name())
    }
}
