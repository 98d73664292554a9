use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use anyhow::{anyhow, Result};
use tracing::{debug, info};

use crate::scheduler::Scheduler;
use crate::session::TrainingSession;

/// Train `session` on `thread` OS threads, then write the artifacts from
/// thread 0's trainers.
///
/// Every thread's trainers are set up here, before any thread starts, so a
/// corpus that can't be opened fails the run without training anything.
/// A thread that fails or panics stops the others after their current step.
pub fn run(session: &TrainingSession) -> Result<()> {
    let threads = session.config().thread;
    let schedulers = (0..threads)
        .map(|id| session.scheduler(id))
        .collect::<Result<Vec<_>>>()?;
    let abort = AtomicBool::new(false);

    info!(threads, roles = session.num_roles(), "training started");
    let start = Instant::now();
    let results: Vec<Result<Scheduler<'_>>> = thread::scope(|s| {
        let handles = schedulers
            .into_iter()
            .enumerate()
            .map(|(id, mut scheduler)| {
                let abort = &abort;
                s.spawn(move || {
                    let _guard = AbortOnPanic(abort);
                    debug!(thread = id, "worker started");
                    if let Err(err) = scheduler.run_until(abort) {
                        abort.store(true, Ordering::Relaxed);
                        return Err(err.context(format!("error in training thread {id}")));
                    }
                    Ok(scheduler)
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .enumerate()
            .map(|(id, handle)| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("training thread {id} panicked")))
            })
            .collect()
    });

    // Threads stopped by the abort flag return Ok; the failure is reported.
    let schedulers = results.into_iter().collect::<Result<Vec<_>>>()?;
    info!(
        elapsed_secs = start.elapsed().as_secs_f64(),
        "training finished"
    );
    match schedulers.into_iter().next() {
        Some(scheduler) => scheduler.close(),
        None => Ok(()),
    }
}

/// Sets the abort flag if the worker thread unwinds.
struct AbortOnPanic<'a>(&'a AtomicBool);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.store(true, Ordering::Relaxed);
        }
    }
}
