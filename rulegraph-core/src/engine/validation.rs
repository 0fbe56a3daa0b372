//! Validation Process Cache
//!
//! One process record per cross-validator instance. A record memoizes the
//! last result until it is invalidated, lets concurrent callers join the run
//! already in flight, and can be cancelled cooperatively: a cancelled run
//! still finishes, but its result is thrown away and its awaiters fall back
//! to the last committed result.
//!
//! Runs are not spawned. Whoever awaits the shared future drives it, so a run
//! nobody awaits any more simply stops.

use std::sync::Arc;

use futures_util::future::{self, BoxFuture, Shared};
use futures_util::FutureExt;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::trace;

use crate::property::{CrossValidator, ValidationMessage, ValidatorId};

#[derive(Debug, Clone)]
enum ValidationOutcome {
    Completed(Vec<ValidationMessage>),
    Cancelled,
}

type RunFuture = Shared<BoxFuture<'static, ValidationOutcome>>;

#[derive(Default)]
struct ValidationProcess {
    is_last_result_up_to_date: bool,
    is_cancelled: bool,
    current_validation: Option<RunFuture>,
    last_validation_result: Option<Vec<ValidationMessage>>,
    /// Incremented per run; a run whose number is no longer current is
    /// treated as cancelled.
    run: u64,
}

/// Per-engine cache of validation processes.
#[derive(Clone, Default)]
pub(crate) struct ValidationProcesses {
    processes: Arc<Mutex<IndexMap<ValidatorId, ValidationProcess>>>,
}

impl ValidationProcesses {
    /// Get the validator's result, running it only when needed.
    pub(crate) fn run(
        &self,
        validator: &CrossValidator,
    ) -> BoxFuture<'static, Vec<ValidationMessage>> {
        let id = validator.id();
        let pending = {
            let mut processes = self.processes.lock();
            let process = processes.entry(id).or_default();

            if process.is_last_result_up_to_date {
                if let Some(result) = &process.last_validation_result {
                    trace!(?id, "reusing validation result");
                    return future::ready(result.clone()).boxed();
                }
            }

            match &process.current_validation {
                Some(current) => {
                    trace!(?id, "joining validation in flight");
                    current.clone()
                }
                None => {
                    process.run += 1;
                    process.is_cancelled = false;
                    let current = self.start(validator.clone(), process.run);
                    process.current_validation = Some(current.clone());
                    current
                }
            }
        };

        let processes = Arc::clone(&self.processes);
        async move {
            match pending.await {
                ValidationOutcome::Completed(messages) => messages,
                ValidationOutcome::Cancelled => processes
                    .lock()
                    .get(&id)
                    .and_then(|process| process.last_validation_result.clone())
                    .unwrap_or_default(),
            }
        }
        .boxed()
    }

    fn start(&self, validator: CrossValidator, run: u64) -> RunFuture {
        let processes = Arc::clone(&self.processes);
        async move {
            let messages = validator.evaluate().await;

            let mut guard = processes.lock();
            let Some(process) = guard.get_mut(&validator.id()) else {
                return ValidationOutcome::Cancelled;
            };
            if process.run != run || process.is_cancelled {
                trace!(id = ?validator.id(), run, "dropping cancelled validation");
                return ValidationOutcome::Cancelled;
            }
            process.current_validation = None;
            process.is_last_result_up_to_date = true;
            process.last_validation_result = Some(messages.clone());
            ValidationOutcome::Completed(messages)
        }
        .boxed()
        .shared()
    }

    /// Invalidate the cached results of `ids` and cancel their runs.
    pub(crate) fn cancel(&self, ids: &[ValidatorId]) {
        if ids.is_empty() {
            return;
        }
        let mut processes = self.processes.lock();
        for id in ids {
            if let Some(process) = processes.get_mut(id) {
                if process.current_validation.take().is_some() {
                    trace!(?id, "cancelling validation in flight");
                }
                process.is_cancelled = true;
                process.is_last_result_up_to_date = false;
            }
        }
    }

    /// Drop the records of `ids` entirely.
    pub(crate) fn forget(&self, ids: &[ValidatorId]) {
        let mut processes = self.processes.lock();
        for id in ids {
            processes.shift_remove(id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.processes.lock().len()
    }
}
