//! The job record.
//!
//! A [`Job`] tracks either an external command (an OS child process) or a
//! worker thread (auxiliary task or important operation). Jobs are shared
//! between the control thread, the error pump and worker threads through
//! `Arc`, so every mutable field sits behind its own small lock:
//!
//! - the status lock guards `running`, `exit_code`, `use_count`, `erroring`;
//! - the errors lock guards the accumulated and not-yet-consumed stderr text;
//! - the progress lock (commands on the job bar, tasks and operations only)
//!   guards the `{total, done, percent, descr, cancelled}` tuple.
//!
//! The registry that owns jobs lives in [`crate::jobs`] and is touched by
//! the control thread exclusively; nothing here locks it.

use std::cell::RefCell;
use std::io::{PipeReader, PipeWriter};
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::pump::Shared;
use crate::spawn::status_to_exit_code;
#[cfg(windows)]
use crate::win::JobObject;
use crate::{Error, Result};

/// Exit code recorded when a command dies from a hard terminate on Windows,
/// mirroring the POSIX `128 + SIGKILL` mapping.
#[cfg(windows)]
const KILLED_EXIT_CODE: u32 = 128 + 9;

/// What a job wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// An external shell command running as a child process.
    Command,
    /// A worker thread doing auxiliary work (e.g. counting directory sizes).
    Task,
    /// A worker thread doing important work (file copying, deletion, ...);
    /// shown on the job bar.
    Operation,
}

/// Progress tuple of a task/operation, read by UI renderers.
#[derive(Debug, Clone)]
pub struct Progress {
    /// Total number of work units, or 0 when unknown.
    pub total: i32,
    /// Units completed so far.
    pub done: i32,
    /// Percentage in 0..=100, or -1 when it cannot be computed.
    pub percent: i32,
    /// Current description shown next to the progress.
    pub descr: String,
    /// Cooperative cancellation flag the worker polls.
    pub cancelled: bool,
}

impl Default for Progress {
    fn default() -> Self {
        Progress {
            total: 0,
            done: 0,
            percent: -1,
            descr: String::new(),
            cancelled: false,
        }
    }
}

fn percent_of(total: i32, done: i32) -> i32 {
    if total > 0 {
        ((i64::from(done) * 100) / i64::from(total)).clamp(0, 100) as i32
    } else {
        -1
    }
}

/// Guarded by the status lock.
struct Status {
    running: bool,
    /// -1 until finished; then the mapped exit code.
    exit_code: i32,
    /// Outstanding logical references; the job is reclaimed only at zero.
    use_count: u32,
    /// The error pump currently owns the job's stderr stream.
    erroring: bool,
}

/// Guarded by the errors lock.
#[derive(Default)]
struct ErrorBuf {
    /// Full history of stderr text.
    errors: String,
    /// Portion not yet consumed by the control thread.
    new_errors: String,
}

type ExitCb = Box<dyn FnOnce(&Arc<Job>) + Send>;

/// Everything needed to intern a new job; assembled by the spawn layer or
/// the worker runner.
pub(crate) struct NewJob {
    pub kind: JobKind,
    pub cmd: String,
    pub pid: Option<u32>,
    pub child: Option<Child>,
    pub err_stream: Option<PipeReader>,
    pub input: Option<PipeWriter>,
    pub output: Option<PipeReader>,
    pub with_op: bool,
    #[cfg(windows)]
    pub job_object: Option<JobObject>,
}

/// A tracked background job.
pub struct Job {
    kind: JobKind,
    cmd: String,
    pid: Option<u32>,
    shared: Arc<Shared>,

    /// The child process; control thread only.
    child: Mutex<Option<Child>>,
    #[cfg(windows)]
    job_object: Option<JobObject>,
    /// Read end of the child's stderr pipe; read by the error pump only.
    pub(crate) err_stream: Option<PipeReader>,
    input: Mutex<Option<PipeWriter>>,
    output: Mutex<Option<PipeReader>>,

    status: Mutex<Status>,
    errors: Mutex<ErrorBuf>,

    /// A soft interrupt was delivered (commands only).
    cancelled: AtomicBool,
    /// Stop showing error dialogs for this job.
    skip_errors: AtomicBool,
    in_menu: AtomicBool,
    on_job_bar: AtomicBool,
    exit_cb: Mutex<Option<ExitCb>>,

    /// Present iff the job carries progress data.
    op: Option<Mutex<Progress>>,
}

impl Job {
    pub(crate) fn new(spec: NewJob, shared: Arc<Shared>) -> Job {
        Job {
            kind: spec.kind,
            cmd: spec.cmd,
            pid: spec.pid,
            shared,
            child: Mutex::new(spec.child),
            #[cfg(windows)]
            job_object: spec.job_object,
            err_stream: spec.err_stream,
            input: Mutex::new(spec.input),
            output: Mutex::new(spec.output),
            status: Mutex::new(Status {
                running: true,
                exit_code: -1,
                use_count: 0,
                erroring: false,
            }),
            errors: Mutex::new(ErrorBuf::default()),
            cancelled: AtomicBool::new(false),
            skip_errors: AtomicBool::new(false),
            in_menu: AtomicBool::new(true),
            on_job_bar: AtomicBool::new(false),
            exit_cb: Mutex::new(None),
            op: spec.with_op.then(|| Mutex::new(Progress::default())),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// The command line or operation description this job was created with.
    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    /// Child process id; `None` for tasks and operations.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the job is still running, polling the child for an exit if
    /// necessary. Control thread only.
    pub fn is_running(&self) -> bool {
        // A poisoned lock counts as running: better to keep a dead entry
        // around than to reclaim a live one.
        let running = self.status.lock().map_or(true, |st| st.running);
        running && self.poll_status()
    }

    /// Non-blocking child status poll. Returns whether the job should still
    /// be considered running. Control thread only.
    pub(crate) fn poll_status(&self) -> bool {
        let Ok(mut child_slot) = self.child.lock() else {
            return true;
        };
        let Some(child) = child_slot.as_mut() else {
            // Worker jobs finish via mark_finished from their own thread;
            // a reaped command already had its status recorded.
            return true;
        };
        let reaped = match child.try_wait() {
            Ok(Some(status)) => Some(status),
            Ok(None) => None,
            Err(_) => None,
        };
        match reaped {
            Some(status) => {
                let exit_code = status_to_exit_code(&status);
                child_slot.take();
                drop(child_slot);
                debug!(pid = ?self.pid, exit_code, cmd = %self.cmd, "reaped child");
                self.mark_finished(exit_code);
                false
            }
            None => true,
        }
    }

    /// Whether the job finished because of a signal (or a hard terminate).
    pub fn was_killed(&self) -> bool {
        self.status
            .lock()
            .map_or(false, |st| !st.running && st.exit_code >= 128)
    }

    /// The mapped exit code once the job has finished.
    pub fn exit_code(&self) -> Option<i32> {
        self.status
            .lock()
            .ok()
            .and_then(|st| (!st.running && st.exit_code >= 0).then_some(st.exit_code))
    }

    pub(crate) fn mark_finished(&self, exit_code: i32) {
        if let Ok(mut st) = self.status.lock() {
            st.running = false;
            st.exit_code = exit_code;
        }
    }

    /// Requests cancellation: a soft interrupt for commands, the cooperative
    /// flag for tasks and operations. Returns `true` when this call newly
    /// cancelled the job.
    pub fn cancel(self: &Arc<Self>) -> bool {
        if self.kind != JobKind::Command {
            return !self.op_cancel();
        }

        let was_cancelled = self.cancelled.load(Ordering::Relaxed);
        let Some(pid) = self.pid else {
            return !was_cancelled;
        };

        #[cfg(unix)]
        {
            // SAFETY: kill(2) is safe to call with any pid and a valid
            // signal number.
            if unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) } == 0 {
                self.cancelled.store(true, Ordering::Relaxed);
            } else {
                warn!(pid, "failed to send SIGINT");
            }
        }
        #[cfg(windows)]
        {
            match crate::win::cancel_process(pid) {
                Ok(()) => self.cancelled.store(true, Ordering::Relaxed),
                Err(e) => warn!(pid, error = %e, "failed to deliver CTRL_BREAK"),
            }
        }

        !was_cancelled
    }

    /// Whether cancellation has been requested.
    pub fn cancelled(&self) -> bool {
        if self.kind != JobKind::Command {
            return self.op_cancelled();
        }
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Hard-kills a running command (POSIX `SIGKILL`, Windows Job Object
    /// termination). No effect on workers or finished jobs; idempotent.
    pub fn terminate(&self) {
        if self.kind != JobKind::Command || !self.is_running() {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            // SAFETY: kill(2) is safe to call with any pid and a valid
            // signal number.
            if unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) } != 0 {
                warn!(pid, "failed to send SIGKILL");
            }
        }
        #[cfg(windows)]
        {
            if let Some(job_object) = &self.job_object {
                job_object.terminate(KILLED_EXIT_CODE);
            } else if let Ok(mut child_slot) = self.child.lock() {
                // No Job Object (assignment failed at spawn): kill the
                // child process alone.
                if let Some(child) = child_slot.as_mut() {
                    if let Err(e) = child.kill() {
                        warn!(pid = ?self.pid, error = %e, "failed to kill child");
                    }
                }
            }
        }
    }

    /// Closes the job's stdio pipes and blocks until the command exits.
    /// Commands only; control thread only.
    pub fn wait(&self) -> Result<()> {
        debug_assert_eq!(
            self.kind,
            JobKind::Command,
            "only external commands can be waited for"
        );

        if !self.is_running() {
            return Ok(());
        }

        // Close input/output first so the child cannot stay blocked on a
        // pipe nobody reads or writes.
        if let Ok(mut input) = self.input.lock() {
            input.take();
        }
        if let Ok(mut output) = self.output.lock() {
            output.take();
        }

        let status = {
            let Ok(mut child_slot) = self.child.lock() else {
                return Ok(());
            };
            let Some(child) = child_slot.as_mut() else {
                return Ok(());
            };
            let status = child.wait().map_err(Error::Wait)?;
            child_slot.take();
            status
        };
        self.mark_finished(status_to_exit_code(&status));
        Ok(())
    }

    /// After a command has exited, gives the error pump a short window to
    /// finish draining its stderr. Returns `true` when the pump is still
    /// reading after the 50 ms cap (timed out).
    pub fn wait_errors(&self) -> bool {
        const STEP: Duration = Duration::from_micros(50);
        const STEPS: u32 = 1000; // 50 ms total

        if self.err_stream.is_none() || self.is_running() {
            return false;
        }

        // Active polling instead of a per-job condvar: jobs are numerous
        // and short-lived, and this path only runs after the child exited.
        let mut erroring = self.is_erroring();
        let mut i = 0;
        while i < STEPS && erroring {
            self.shared.wake.signal();
            thread::sleep(STEP);
            erroring = self.is_erroring();
            i += 1;
        }
        erroring
    }

    pub fn incref(&self) {
        if let Ok(mut st) = self.status.lock() {
            st.use_count += 1;
        }
    }

    pub fn decref(&self) {
        if let Ok(mut st) = self.status.lock() {
            debug_assert!(st.use_count > 0, "excessive decref");
            st.use_count = st.use_count.saturating_sub(1);
        }
    }

    /// Registers a callback run once on the control thread when the job is
    /// found finished, before it can be reclaimed.
    pub fn set_exit_cb<F>(&self, cb: F)
    where
        F: FnOnce(&Arc<Job>) + Send + 'static,
    {
        if let Ok(mut slot) = self.exit_cb.lock() {
            *slot = Some(Box::new(cb));
        }
    }

    pub(crate) fn take_exit_cb(&self) -> Option<ExitCb> {
        self.exit_cb.lock().ok().and_then(|mut slot| slot.take())
    }

    /// The write end of the child's stdin pipe, when one was requested.
    pub fn take_input(&self) -> Option<PipeWriter> {
        self.input.lock().ok().and_then(|mut slot| slot.take())
    }

    /// The read end of the child's stdout pipe, when capture was requested.
    pub fn take_output(&self) -> Option<PipeReader> {
        self.output.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Full history of stderr text collected so far.
    pub fn errors(&self) -> String {
        self.errors
            .lock()
            .map(|buf| buf.errors.clone())
            .unwrap_or_default()
    }

    /// Appends error text to both the history and the unconsumed portion.
    pub(crate) fn append_error(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Ok(mut buf) = self.errors.lock() {
            buf.errors.push_str(text);
            buf.new_errors.push_str(text);
        }
    }

    /// Takes the unconsumed error text in one swap; rendering happens
    /// outside the lock.
    pub(crate) fn take_new_errors(&self) -> Option<String> {
        let mut buf = self.errors.lock().ok()?;
        if buf.new_errors.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut buf.new_errors))
        }
    }

    pub fn skip_errors(&self) -> bool {
        self.skip_errors.load(Ordering::Relaxed)
    }

    pub fn set_skip_errors(&self, skip: bool) {
        self.skip_errors.store(skip, Ordering::Relaxed);
    }

    /// Whether the job is listed in the jobs menu.
    pub fn in_menu(&self) -> bool {
        self.in_menu.load(Ordering::Relaxed)
    }

    pub(crate) fn set_in_menu(&self, in_menu: bool) {
        self.in_menu.store(in_menu, Ordering::Relaxed);
    }

    pub fn on_job_bar(&self) -> bool {
        self.on_job_bar.load(Ordering::Relaxed)
    }

    pub(crate) fn set_on_job_bar(&self, on_bar: bool) {
        self.on_job_bar.store(on_bar, Ordering::Relaxed);
    }

    /// Marks the job as owned by the error pump; paired with
    /// [`pump_release`](Self::pump_release).
    pub(crate) fn mark_erroring(&self) {
        if let Ok(mut st) = self.status.lock() {
            st.erroring = true;
            st.use_count += 1;
        }
    }

    /// Drops the pump's interest in the job. Returns whether the status
    /// could be updated; the caller retries later otherwise.
    pub(crate) fn pump_release(&self) -> bool {
        match self.status.lock() {
            Ok(mut st) => {
                st.use_count = st.use_count.saturating_sub(1);
                st.erroring = false;
                true
            }
            Err(_) => false,
        }
    }

    pub(crate) fn is_erroring(&self) -> bool {
        self.status.lock().map_or(false, |st| st.erroring)
    }

    /// `(running, reclaimable)` in one lock section. A poisoned lock counts
    /// as running and never reclaimable.
    pub(crate) fn status_snapshot(&self) -> (bool, bool) {
        match self.status.lock() {
            Ok(st) => (st.running, !st.running && st.use_count == 0),
            Err(_) => (true, false),
        }
    }

    // --- progress tuple -------------------------------------------------

    /// Whether the job carries progress data.
    pub fn has_progress(&self) -> bool {
        self.op.is_some()
    }

    /// Consistent snapshot of the progress tuple.
    pub fn progress(&self) -> Option<Progress> {
        let op = self.op.as_ref()?;
        op.lock().ok().map(|p| p.clone())
    }

    /// Swaps the progress description and notifies the job bar.
    pub fn set_descr(self: &Arc<Self>, descr: &str) {
        let Some(op) = &self.op else { return };
        match op.lock() {
            Ok(mut p) => p.descr = descr.to_string(),
            Err(_) => return,
        }
        self.shared.job_bar.changed(self);
    }

    /// Updates the progress counters and notifies the job bar.
    pub fn set_progress(self: &Arc<Self>, total: i32, done: i32) {
        let Some(op) = &self.op else { return };
        match op.lock() {
            Ok(mut p) => {
                p.total = total;
                p.done = done;
                p.percent = percent_of(total, done);
            }
            Err(_) => return,
        }
        self.shared.job_bar.changed(self);
    }

    /// Seeds the tuple before the job becomes visible anywhere, so the
    /// first bar redraw already has a description.
    pub(crate) fn init_progress(&self, descr: &str, total: i32) {
        let Some(op) = &self.op else { return };
        if let Ok(mut p) = op.lock() {
            p.descr = descr.to_string();
            p.total = total;
        }
    }

    /// Sets the cooperative cancellation flag, notifying the job bar.
    /// Returns the previous value.
    pub(crate) fn op_cancel(self: &Arc<Self>) -> bool {
        let Some(op) = &self.op else { return false };
        let was_cancelled = match op.lock() {
            Ok(mut p) => {
                let was = p.cancelled;
                p.cancelled = true;
                was
            }
            // Report "no change" when the flag cannot be inspected.
            Err(_) => return true,
        };
        self.shared.job_bar.changed(self);
        was_cancelled
    }

    pub(crate) fn op_cancelled(&self) -> bool {
        self.op
            .as_ref()
            .and_then(|op| op.lock().ok().map(|p| p.cancelled))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("kind", &self.kind)
            .field("cmd", &self.cmd)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Handle a worker closure receives for reporting progress and polling
/// cancellation. Usable from the worker thread only by convention, but all
/// operations are thread-safe.
pub struct OpHandle {
    job: Arc<Job>,
}

impl OpHandle {
    pub(crate) fn new(job: Arc<Job>) -> OpHandle {
        OpHandle { job }
    }

    pub fn set_descr(&self, descr: &str) {
        self.job.set_descr(descr);
    }

    pub fn set_progress(&self, total: i32, done: i32) {
        self.job.set_progress(total, done);
    }

    /// Workers poll this and return early when it turns true.
    pub fn cancelled(&self) -> bool {
        self.job.op_cancelled()
    }

    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }
}

thread_local! {
    /// The job bound to the current worker thread, if any. Lets helpers
    /// attribute error text to the running job instead of popping dialogs.
    static CURRENT_JOB: RefCell<Option<Arc<Job>>> = const { RefCell::new(None) };
}

pub(crate) fn set_current_job(job: Option<Arc<Job>>) {
    CURRENT_JOB.with(|slot| *slot.borrow_mut() = job);
}

/// Appends error text to the job bound to the current thread, if there is
/// one. Returns whether the text was routed; callers fall back to a dialog
/// otherwise.
pub fn route_error_to_current_job(text: &str) -> bool {
    CURRENT_JOB.with(|slot| match &*slot.borrow() {
        Some(job) => {
            job.append_error(text);
            true
        }
        None => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_clamped() {
        assert_eq!(percent_of(10, 0), 0);
        assert_eq!(percent_of(10, 5), 50);
        assert_eq!(percent_of(10, 10), 100);
        assert_eq!(percent_of(10, 15), 100);
        assert_eq!(percent_of(10, -5), 0);
    }

    #[test]
    fn percent_unknown_without_total() {
        assert_eq!(percent_of(0, 3), -1);
        assert_eq!(percent_of(-1, 3), -1);
    }

    #[test]
    fn progress_starts_unknown() {
        let p = Progress::default();
        assert_eq!(p.percent, -1);
        assert!(!p.cancelled);
    }
}
