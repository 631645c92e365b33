//! Job-control interfaces and the single-job blocking wait.
//!
//! Commands with a blocking shape ("dhcp", "sanboot") start an asynchronous
//! operation, plug its job interface into a [`MonoJob`], and spin the
//! scheduler until the job closes or a deadline passes.

use alloc::string::String;
use alloc::sync::Arc;

use spin::Mutex;

use crate::error::{Error, Result};
use crate::intf::{XferMeta, XferTarget};
use crate::iobuf::IoBuffer;
use crate::process;

/// Progress snapshot of a job
#[derive(Debug, Clone, Default)]
pub struct JobProgress {
    /// Amount of operation completed (bytes, steps - operation defined)
    pub completed: u64,
    /// Total operation size, zero if unknown
    pub total: u64,
    /// One-line status message
    pub message: String,
}

/// Operations a job-control destination implements
pub trait JobTarget: Send + Sync {
    /// Report current progress
    fn progress(&self) -> JobProgress {
        JobProgress::default()
    }

    /// The job has finished with the given result
    fn close(&self, rc: Result<()>);
}

/// A job endpoint that records its completion for a blocking waiter
#[derive(Default)]
pub struct MonoJob {
    rc: Mutex<Option<Result<()>>>,
}

impl MonoJob {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Completion status, once closed
    pub fn result(&self) -> Option<Result<()>> {
        *self.rc.lock()
    }

    /// Spin the scheduler until the job completes
    ///
    /// `deadline` bounds the wait in ticks; `None` waits indefinitely.
    pub fn wait(&self, deadline: Option<u64>) -> Result<()> {
        let finished = process::wait_until(|| self.result().is_some(), deadline);
        if !finished {
            return Err(Error::TimedOut);
        }
        self.result().unwrap_or(Err(Error::Cancelled))
    }
}

impl JobTarget for MonoJob {
    fn close(&self, rc: Result<()>) {
        let mut slot = self.rc.lock();
        // First close wins; cascaded duplicates are ignored
        if slot.is_none() {
            *slot = Some(rc);
        }
    }
}

impl XferTarget for MonoJob {
    fn deliver(&self, _iobuf: IoBuffer, _meta: &XferMeta) -> Result<()> {
        // Job endpoints carry no data
        Ok(())
    }

    fn close(&self, rc: Result<()>) {
        JobTarget::close(self, rc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_close_wins() {
        let job = MonoJob::new();
        JobTarget::close(&*job, Err(Error::TimedOut));
        JobTarget::close(&*job, Ok(()));
        assert_eq!(job.result(), Some(Err(Error::TimedOut)));
    }

    #[test]
    fn wait_returns_result() {
        let job = MonoJob::new();
        JobTarget::close(&*job, Ok(()));
        assert_eq!(job.wait(Some(1)), Ok(()));
    }
}
