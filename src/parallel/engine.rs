use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::stream::ParallelError;
use crate::errors::is_cancellation;

/// How a parallel loop reacts to a faulted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailMode {
    /// Every item is yielded, then the loop task fails with the recorded
    /// error(s), or reports cancellation if the shutdown token fired.
    #[default]
    Default,
    /// The first fault stops dispatching. The loop task itself succeeds and
    /// most undispatched items are never yielded.
    Fast,
    /// Faults never stop the loop and every item is yielded.
    Smart,
}

#[derive(Debug, Clone, Copy)]
pub struct ParallelizeOption {
    pub max_degree_of_parallelism: usize,
    pub fail_mode: FailMode,
}

/// Shared state of one parallel loop: recorded faults, the loop-break flag
/// and the two cancellation sources.
///
/// `global` is a child of the external shutdown token, so it trips when the
/// user asks to stop. A fault under [`FailMode::Fast`] trips `fault` and
/// `global` without touching the shutdown token.
pub(crate) struct ParallelizeCore {
    errors: Mutex<Vec<Arc<anyhow::Error>>>,
    loop_break: AtomicBool,
    shutdown: CancellationToken,
    fault: CancellationToken,
    global: CancellationToken,
    fail_mode: FailMode,
}

impl ParallelizeCore {
    pub(crate) fn new(shutdown: CancellationToken, fail_mode: FailMode) -> Self {
        let global = shutdown.child_token();
        Self {
            errors: Mutex::new(Vec::new()),
            loop_break: AtomicBool::new(false),
            shutdown,
            fault: CancellationToken::new(),
            global,
            fail_mode,
        }
    }

    pub(crate) fn fail_mode(&self) -> FailMode {
        self.fail_mode
    }

    pub(crate) fn is_loop_break_requested(&self) -> bool {
        self.loop_break.load(Ordering::SeqCst) || self.global.is_cancelled()
    }

    pub(crate) fn global_token(&self) -> CancellationToken {
        self.global.clone()
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn break_reason(&self) -> &'static str {
        if self.fault.is_cancelled() {
            "fault"
        } else if self.shutdown.is_cancelled() {
            "shutdown"
        } else {
            "none"
        }
    }

    pub(crate) fn on_exception(&self, error: Arc<anyhow::Error>) {
        if is_cancellation(&error) {
            return;
        }
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(error.clone());
        }
        if self.fail_mode == FailMode::Fast {
            if !self.fault.is_cancelled() {
                warn!("Fail-fast: stopping dispatch after error: {:#}", error);
            }
            self.loop_break.store(true, Ordering::SeqCst);
            self.fault.cancel();
            self.global.cancel();
        }
    }

    /// Final status of the loop once every worker has finished.
    pub(crate) fn into_result(self) -> Result<(), ParallelError> {
        if self.fail_mode != FailMode::Default {
            return Ok(());
        }
        let canceled = self.is_canceled();
        let mut errors = self.errors.into_inner().unwrap_or_default();
        match errors.len() {
            0 if canceled => Err(ParallelError::Canceled),
            0 => Ok(()),
            1 => Err(ParallelError::Faulted(errors.remove(0))),
            _ => Err(ParallelError::Aggregate(errors)),
        }
    }
}

/// Per-worker-slot register of the item currently being processed.
pub struct ParallelMonitor<T> {
    slots: Mutex<Vec<Option<T>>>,
}

impl<T: Clone> ParallelMonitor<T> {
    pub fn new(max_degree_of_parallelism: usize) -> Result<Self, ParallelError> {
        if max_degree_of_parallelism == 0 {
            return Err(ParallelError::InvalidDegree);
        }
        Ok(Self {
            slots: Mutex::new(vec![None; max_degree_of_parallelism]),
        })
    }

    pub fn set_active(&self, index: usize, item: T) {
        if let Ok(mut slots) = self.slots.lock() {
            if let Some(slot) = slots.get_mut(index) {
                *slot = Some(item);
            }
        }
    }

    pub fn set_inactive(&self, index: usize) {
        if let Ok(mut slots) = self.slots.lock() {
            if let Some(slot) = slots.get_mut(index) {
                *slot = None;
            }
        }
    }

    /// Snapshot of `(worker slot, item)` pairs currently in flight.
    pub fn active(&self) -> Vec<(usize, T)> {
        match self.slots.lock() {
            Ok(slots) => slots
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.clone().map(|item| (i, item)))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }
}
