//! Where background jobs run.
//!
//! Jobs report back over an `mpsc` channel that the owning component drains in
//! its `poll()`. With `TaskRunner::Inline` the job runs on the caller's thread
//! but its result still waits in the channel, so pending flags behave the same
//! as on the pool.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TaskRunner {
    /// `rayon::spawn` on the global pool.
    #[default]
    Pool,
    /// Run to completion before `spawn` returns.
    Inline,
}

impl TaskRunner {
    pub fn spawn<F>(self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            TaskRunner::Pool => rayon::spawn(job),
            TaskRunner::Inline => job(),
        }
    }
}
