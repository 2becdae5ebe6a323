//! The error pump.
//!
//! One process-wide thread multiplexes the stderr pipes of all live command
//! jobs and appends whatever it reads into the per-job error buffers. This
//! keeps potentially blocking reads off the control thread, lets producers
//! write without backpressure, and lets the control thread decide when (and
//! whether) to show dialogs.
//!
//! Freshly spawned command jobs reach the pump through the handoff list in
//! [`Shared`]; the registry marks them `erroring` and takes a use-count
//! reference on their behalf before publishing them. The pump gives both
//! back when a stream drains, which is what finally allows the reconciler
//! to reclaim the job.

use std::io::Read;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use crate::job::{Job, JobKind};
use crate::ports::JobBar;
use crate::select::{Selector, WakeEvent, stream_handle};
use crate::{Error, Result};

/// How long one multiplexed wait may block.
const SELECT_TIMEOUT: Duration = Duration::from_millis(250);

/// Upper bound on a single stderr read.
const ERR_CHUNK_LEN: usize = 1024;

/// State reachable from threads other than the control thread.
pub(crate) struct Shared {
    /// Newly spawned command jobs waiting to be picked up by the pump.
    /// The only cross-thread mutable list in the subsystem.
    pub(crate) handoff: Mutex<Vec<Arc<Job>>>,
    pub(crate) handoff_cond: Condvar,
    /// Kicks the pump out of its multiplexed wait.
    pub(crate) wake: WakeEvent,
    /// Job-bar port; `changed` notifications fire from worker threads.
    pub(crate) job_bar: Arc<dyn JobBar>,
}

/// Starts the pump thread. It runs for the lifetime of the process,
/// sleeping on the handoff condvar whenever it has nothing to watch.
pub(crate) fn spawn_pump(shared: Arc<Shared>) -> Result<()> {
    thread::Builder::new()
        .name("fm-jobs-errors".to_string())
        .spawn(move || {
            block_thread_signals();
            pump_loop(&shared);
        })
        .map(drop)
        .map_err(Error::PumpSpawn)
}

/// Signal handling belongs to the control thread; every thread this crate
/// starts masks everything first.
pub(crate) fn block_thread_signals() {
    #[cfg(unix)]
    {
        let _ = nix::sys::signal::SigSet::all().thread_block();
    }
}

/// A job the pump currently watches. `drained` is pump-private state: once
/// set, the entry is only good for being pruned.
struct PumpEntry {
    job: Arc<Job>,
    drained: bool,
}

fn pump_loop(shared: &Shared) {
    let mut jobs: Vec<PumpEntry> = Vec::new();
    let mut selector = Selector::new();
    let mut buf = [0u8; ERR_CHUNK_LEN];

    loop {
        prune_drained(&mut jobs);
        import_new_jobs(shared, &mut jobs);

        selector.reset();
        for entry in &jobs {
            if let Some(stream) = entry.job.err_stream.as_ref() {
                selector.add(stream_handle(stream));
            }
        }
        selector.add(shared.wake.wait_handle());

        while selector.wait(SELECT_TIMEOUT) {
            let mut need_update = jobs.is_empty();

            if selector.is_ready(shared.wake.wait_handle()) {
                shared.wake.reset();
            }

            for entry in &mut jobs {
                if entry.drained {
                    // Prune promptly so finished jobs can be reclaimed
                    // instead of idling here until the next import.
                    need_update = true;
                    continue;
                }
                let Some(stream) = entry.job.err_stream.as_ref() else {
                    entry.drained = true;
                    continue;
                };
                if !selector.is_ready(stream_handle(stream)) {
                    continue;
                }

                let mut reader = stream;
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => {
                        trace!(cmd = %entry.job.cmd(), "stderr stream drained");
                        entry.drained = true;
                        need_update = true;
                    }
                    Ok(n) => {
                        entry
                            .job
                            .append_error(&String::from_utf8_lossy(&buf[..n]));
                    }
                }
            }

            if !need_update {
                need_update = shared
                    .handoff
                    .lock()
                    .map_or(false, |handoff| !handoff.is_empty());
            }
            if need_update {
                break;
            }
        }
    }
}

/// Drops drained entries, releasing the pump's use-count reference and
/// clearing `erroring`. Entries whose status cannot be updated stay for a
/// retry on the next round.
fn prune_drained(jobs: &mut Vec<PumpEntry>) {
    jobs.retain(|entry| {
        if entry.drained && entry.job.pump_release() {
            debug!(cmd = %entry.job.cmd(), "released drained job");
            false
        } else {
            true
        }
    });
}

/// Pulls freshly spawned jobs out of the handoff list, blocking on the
/// condvar while there is nothing to watch at all.
fn import_new_jobs(shared: &Shared, jobs: &mut Vec<PumpEntry>) {
    let Ok(mut handoff) = shared.handoff.lock() else {
        return;
    };
    while jobs.is_empty() && handoff.is_empty() {
        handoff = match shared.handoff_cond.wait(handoff) {
            Ok(guard) => guard,
            Err(_) => return,
        };
    }
    let imported: Vec<Arc<Job>> = handoff.drain(..).collect();
    drop(handoff);

    for job in imported {
        debug_assert_eq!(
            job.kind(),
            JobKind::Command,
            "only external commands carry error streams"
        );
        jobs.insert(0, PumpEntry { job, drained: false });
    }
}
