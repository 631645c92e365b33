//! # Cooperative Scheduler
//!
//! A table of permanent processes stepped round-robin. Processes never
//! block: each `step` does a bounded amount of work and returns. All
//! asynchrony in the system is expressed by returning control to this loop.
//!
//! Cancellation is not a scheduler concept - in-flight work is cancelled by
//! shutting down the interface graph that owns it.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;

/// A schedulable process
pub trait Process: Send + Sync {
    /// Name for diagnostics
    fn name(&self) -> &str;

    /// Perform one bounded unit of work
    fn step(&self);
}

static PROCESSES: RwLock<Vec<Arc<dyn Process>>> = RwLock::new(Vec::new());

/// Add a process to the permanent process table
pub fn register_process(process: Arc<dyn Process>) {
    log::debug!("process {} registered", process.name());
    PROCESSES.write().push(process);
}

/// Remove a process from the table
pub fn unregister_process(process: &Arc<dyn Process>) {
    PROCESSES.write().retain(|p| !Arc::ptr_eq(p, process));
}

/// Step every registered process once, in registration order
///
/// This is the single suspension point of the system: state invariants must
/// hold whenever control reaches here.
pub fn step_all() {
    let snapshot: Vec<Arc<dyn Process>> = PROCESSES.read().clone();
    for process in snapshot {
        process.step();
    }
}

/// Run the scheduler until `done` reports completion or `deadline` ticks
/// pass, advancing the simulated clock only where the platform does so
///
/// Used by the blocking entry points exposed to legacy callers (shell
/// commands, SAN reads).
pub fn wait_until<F: FnMut() -> bool>(mut done: F, deadline: Option<u64>) -> bool {
    let limit = deadline.map(|d| crate::ticks::currticks() + d);
    loop {
        if done() {
            return true;
        }
        if let Some(limit) = limit {
            if crate::ticks::currticks() >= limit {
                return false;
            }
        }
        step_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        steps: AtomicUsize,
    }

    impl Process for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn step(&self) {
            self.steps.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn processes_are_stepped_and_unregistered() {
        let p = Arc::new(Counter {
            steps: AtomicUsize::new(0),
        });
        register_process(p.clone());
        step_all();
        let after_one = p.steps.load(Ordering::Relaxed);
        assert!(after_one >= 1);

        let dyn_p: Arc<dyn Process> = p.clone();
        unregister_process(&dyn_p);
        step_all();
        assert_eq!(p.steps.load(Ordering::Relaxed), after_one);
    }
}
