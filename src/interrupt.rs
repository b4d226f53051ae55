use crate::error::PipeResult;
use crate::logger::NamedLogger;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Exit status after a second Ctrl-C
pub const INTERRUPT_EXIT_CODE: i32 = 130;

/// Cooperative cancellation flag, checked by the pipeline between cycles
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; the running cycle completes first
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct TrapState {
    installed: bool,
    generation: u64,
    armed: Option<CancellationToken>,
}

#[derive(Debug, PartialEq, Eq)]
enum InterruptAction {
    /// The armed token was cancelled
    Cancelled,
    /// Second Ctrl-C while draining
    Exit,
    /// Nothing is draining; behave like the default handler
    ExitQuietly,
}

impl TrapState {
    fn arm(&mut self, token: CancellationToken) -> u64 {
        self.generation += 1;
        self.armed = Some(token);
        self.generation
    }

    fn disarm(&mut self, generation: u64) {
        if self.generation == generation {
            self.armed = None;
        }
    }

    fn on_interrupt(&self) -> InterruptAction {
        match &self.armed {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                InterruptAction::Cancelled
            }
            Some(_) => InterruptAction::Exit,
            None => InterruptAction::ExitQuietly,
        }
    }
}

lazy_static::lazy_static! {
    static ref TRAP: Mutex<TrapState> = Mutex::new(TrapState::default());
}

/// Keeps Ctrl-C bound to a token; dropping it releases the binding
#[derive(Debug)]
pub struct CtrlCGuard {
    generation: u64,
}

impl Drop for CtrlCGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = TRAP.lock() {
            state.disarm(self.generation);
        }
    }
}

/// Bind Ctrl-C to `token` until the returned guard is dropped
///
/// The first Ctrl-C cancels the token, the second exits the process with
/// [`INTERRUPT_EXIT_CODE`]. Once the guard is gone a Ctrl-C exits right away.
/// The signal listener is a single thread shared by every pipeline.
pub fn trap_ctrl_c(token: CancellationToken) -> PipeResult<CtrlCGuard> {
    let mut state = TRAP.lock()?;
    if !state.installed {
        spawn_listener()?;
        state.installed = true;
    }
    Ok(CtrlCGuard {
        generation: state.arm(token),
    })
}

/// Whether some pipeline currently owns Ctrl-C
pub(crate) fn is_trapped() -> bool {
    TRAP.lock().map(|state| state.armed.is_some()).unwrap_or(false)
}

fn spawn_listener() -> PipeResult<()> {
    thread::Builder::new()
        .name("blobflow-ctrl-c".to_string())
        .spawn(|| {
            let logger = NamedLogger::new("Pipeline");
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    logger.error(&format!("Unable to trap Ctrl-C: {}", e));
                    return;
                }
            };

            runtime.block_on(async move {
                while tokio::signal::ctrl_c().await.is_ok() {
                    let action = match TRAP.lock() {
                        Ok(state) => state.on_interrupt(),
                        Err(_) => InterruptAction::Exit,
                    };
                    match action {
                        InterruptAction::Cancelled => logger.warn(
                            "Interrupt requested, the current cycle will be completed. \
                             Press Ctrl-C again to exit immediately.",
                        ),
                        InterruptAction::Exit => {
                            logger.error("Second interrupt, exiting without cleanup.");
                            std::process::exit(INTERRUPT_EXIT_CODE);
                        }
                        InterruptAction::ExitQuietly => std::process::exit(INTERRUPT_EXIT_CODE),
                    }
                }
            });
        })?;
    Ok(())
}
