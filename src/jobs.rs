//! The job registry and its control-thread API.
//!
//! [`Jobs`] owns the registry of live jobs and is deliberately neither
//! `Send` nor `Sync`: every public call happens on the host's main (control)
//! thread, which is the only thread allowed to mutate the registry
//! structure. Cross-thread traffic goes through per-job locks and the
//! handoff list in [`crate::pump`], never through the registry itself.
//!
//! The host drives the subsystem by calling [`Jobs::check`] from its event
//! loop: children are reaped, accumulated error text is surfaced, exit
//! callbacks run, and finished jobs whose use count reached zero are
//! reclaimed.

use std::cell::{Cell, RefCell};
use std::fs::File;
use std::io::PipeWriter;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tracing::{debug, warn};

use crate::job::{Job, JobKind, NewJob, OpHandle, route_error_to_current_job, set_current_job};
use crate::ports::{Cancellation, ErrorDialog, Hooks, Redraw, ShellRequester, ShellSpec, Variables};
use crate::pump::{Shared, block_thread_signals, spawn_pump};
use crate::select::WakeEvent;
use crate::spawn::{self, Captured, JobFlags};
use crate::{Error, Result};

/// Builtin variable that mirrors the number of running menu-visible jobs.
pub const JOBCOUNT_VAR: &str = "v:jobcount";

/// The background job subsystem. One instance per host session, owned and
/// driven by the control thread.
pub struct Jobs {
    shared: Arc<Shared>,
    /// Registry of live jobs, newest first. Control thread only, hence no
    /// lock; `RefCell` makes the type `!Sync` on purpose.
    registry: RefCell<Vec<Arc<Job>>>,
    /// Re-entrancy guard for [`check`](Self::check).
    checking: Cell<bool>,
    dialog: Box<dyn ErrorDialog>,
    variables: Box<dyn Variables>,
    redraw: Box<dyn Redraw>,
    shell: ShellSpec,
}

impl Jobs {
    /// Wires up the subsystem and starts the error-pump thread.
    pub fn new(hooks: Hooks) -> Result<Jobs> {
        let wake = WakeEvent::new().map_err(Error::Event)?;
        let shared = Arc::new(Shared {
            handoff: Mutex::new(Vec::new()),
            handoff_cond: Condvar::new(),
            wake,
            job_bar: hooks.job_bar,
        });
        spawn_pump(Arc::clone(&shared))?;
        Ok(Jobs {
            shared,
            registry: RefCell::new(Vec::new()),
            checking: Cell::new(false),
            dialog: hooks.dialog,
            variables: hooks.variables,
            redraw: hooks.redraw,
            shell: hooks.shell,
        })
    }

    /// Periodic reconciliation: reap children, surface error output, run
    /// exit callbacks, reclaim finished jobs and publish the active-job
    /// count. Not re-entrant; nested calls (e.g. from an exit callback)
    /// are no-ops.
    pub fn check(&self, show_errors: bool) {
        if self.checking.get() {
            return;
        }
        self.checking.set(true);

        self.maybe_wake_pump();

        // Detach the registry so exit callbacks may call back into the API
        // (including launching new jobs) without racing this walk.
        let head = self.registry.take();
        let mut kept = Vec::with_capacity(head.len());
        let mut active_jobs = 0;

        for job in head {
            if show_errors {
                self.show_job_errors(&job);
            }

            // Status check; the exit code is of no use here.
            let _ = job.poll_status();

            let (running, _) = job.status_snapshot();

            if running && job.in_menu() {
                active_jobs += 1;
            }

            if !running {
                if job.on_job_bar() {
                    self.get_off_job_bar(&job);
                }
                if let Some(cb) = job.take_exit_cb() {
                    cb(&job);
                }
            }

            // Re-snapshot after the callback: it may have taken a new
            // reference to the job.
            let (_, can_remove) = job.status_snapshot();
            if can_remove {
                debug!(cmd = %job.cmd(), "reclaiming finished job");
            } else {
                kept.push(job);
            }
        }

        // Jobs launched by exit callbacks landed in the (then empty)
        // registry; they stay at the head, followed by the survivors.
        let mut registry = self.registry.borrow_mut();
        let mut restored = std::mem::take(&mut *registry);
        restored.extend(kept);
        *registry = restored;
        drop(registry);

        self.set_jobcount(active_jobs);

        self.checking.set(false);
    }

    /// Fire-and-forget external command. When `want_input` is set, the
    /// write end of the child's stdin pipe is handed back to the caller;
    /// the job itself keeps nothing to close later.
    pub fn run_external(
        &self,
        cmd: &str,
        keep_in_fg: bool,
        skip_errors: bool,
        by: ShellRequester,
        want_input: bool,
    ) -> Result<Option<PipeWriter>> {
        let mut flags = JobFlags::empty();
        if keep_in_fg {
            flags |= JobFlags::KEEP_IN_FG;
        }
        if want_input {
            flags |= JobFlags::SUPPLY_INPUT;
        }

        let job = self.launch(cmd, None, flags, by)?;
        // Safe to set after interning: this runs on the same thread as
        // check(), so no pass can observe the job in between.
        job.set_skip_errors(skip_errors);
        Ok(if want_input { job.take_input() } else { None })
    }

    /// Launches an external command and returns its refcounted handle; the
    /// caller owns one use-count reference and must `decref` when done.
    pub fn run_external_job(
        &self,
        cmd: &str,
        flags: JobFlags,
        descr: Option<&str>,
        pwd: Option<&Path>,
    ) -> Result<Arc<Job>> {
        let job = self.launch(cmd, pwd, flags, ShellRequester::ByApp)?;

        job.incref();
        // Errors of handle-managed jobs are read through the handle, not
        // shown in dialogs.
        job.set_skip_errors(true);

        if flags.contains(JobFlags::JOB_BAR_VISIBLE) {
            // Describe before placing on the bar so the first redraw
            // already has the text.
            if let Some(descr) = descr {
                job.set_descr(descr);
            }
            self.place_on_job_bar(&job);
        }

        job.set_in_menu(flags.contains(JobFlags::MENU_VISIBLE));

        Ok(job)
    }

    /// Runs `func` on a dedicated worker thread bound to a new job of kind
    /// `Operation` (when `important`) or `Task`. The worker reports
    /// progress through the handle it receives and is expected to poll
    /// [`OpHandle::cancelled`].
    pub fn execute<F>(
        &self,
        descr: &str,
        op_descr: &str,
        total: i32,
        important: bool,
        func: F,
    ) -> Result<()>
    where
        F: FnOnce(&OpHandle) + Send + 'static,
    {
        let kind = if important {
            JobKind::Operation
        } else {
            JobKind::Task
        };
        let job = self.add_job(NewJob {
            kind,
            cmd: descr.to_string(),
            pid: None,
            child: None,
            err_stream: None,
            input: None,
            output: None,
            with_op: true,
            #[cfg(windows)]
            job_object: None,
        });
        job.init_progress(op_descr, total);

        if kind == JobKind::Operation {
            self.place_on_job_bar(&job);
        }

        let worker_job = Arc::clone(&job);
        let spawned = thread::Builder::new()
            .name("fm-jobs-worker".to_string())
            .spawn(move || {
                block_thread_signals();
                set_current_job(Some(Arc::clone(&worker_job)));

                let handle = OpHandle::new(Arc::clone(&worker_job));
                let outcome = catch_unwind(AssertUnwindSafe(|| func(&handle)));

                set_current_job(None);
                worker_job.mark_finished(if outcome.is_ok() { 0 } else { 1 });
            });

        if let Err(e) = spawned {
            warn!(descr, error = %e, "failed to start worker thread");
            job.mark_finished(1);
            return Err(Error::WorkerSpawn(e));
        }
        Ok(())
    }

    /// Synchronously runs `cmd`, collecting its stderr. Returns the exit
    /// code, or -1 when spawning failed or the command produced error
    /// output (which is then reported through the dialog port, or appended
    /// to the current worker's job when called from one).
    pub fn and_wait_for_errors(&self, cmd: &str, cancellation: &dyn Cancellation) -> i32 {
        #[cfg(unix)]
        {
            self.and_wait_for_errors_impl(cmd, cancellation)
        }
        #[cfg(windows)]
        {
            let _ = (cmd, cancellation);
            -1
        }
    }

    #[cfg(unix)]
    fn and_wait_for_errors_impl(&self, cmd: &str, cancellation: &dyn Cancellation) -> i32 {
        use std::io::Read as _;
        use std::os::fd::AsRawFd as _;
        use std::process::Stdio;
        use std::time::Duration;

        use crate::select::Selector;
        use crate::spawn::status_to_exit_code;

        let mut command = self.shell.command(cmd, ShellRequester::ByApp);
        command.stderr(Stdio::piped());
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(_) => return -1,
        };
        let Some(mut stderr) = child.stderr.take() else {
            let _ = child.wait();
            return -1;
        };

        let fd = stderr.as_raw_fd();
        let mut selector = Selector::new();
        let mut errors = String::new();
        let mut saw_output = false;
        let mut interrupted = false;
        let mut buf = [0u8; 1024];

        loop {
            if cancellation.requested() && !interrupted {
                interrupted = true;
                // SAFETY: kill(2) is safe to call with any pid and a valid
                // signal number.
                unsafe {
                    let _ = libc::kill(child.id() as libc::pid_t, libc::SIGINT);
                }
            }

            selector.reset();
            selector.add(fd);
            if !selector.wait(Duration::from_millis(250)) {
                continue;
            }

            match stderr.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    saw_output = true;
                    // A lone blank line still counts as failure output but
                    // is not worth echoing.
                    if !(n == 1 && buf[0] == b'\n') {
                        errors.push_str(&String::from_utf8_lossy(&buf[..n]));
                    }
                }
            }
        }
        drop(stderr);

        // No process-wide reaper exists here, so always collect the child.
        let status = match child.wait() {
            Ok(status) => status,
            Err(_) => return -1,
        };

        if saw_output {
            self.report_error("Background Process Error", &errors);
            return -1;
        }
        status_to_exit_code(&status)
    }

    /// Synchronous spawn with captured streams. The child is not tracked
    /// by the registry; the caller reads the streams and waits on the
    /// returned handle.
    pub fn run_and_capture(
        &self,
        cmd: &str,
        user_sh: bool,
        stdin: Option<File>,
        want_stdout: bool,
        want_stderr: bool,
    ) -> Result<Captured> {
        spawn::run_and_capture(&self.shell, cmd, user_sh, stdin, want_stdout, want_stderr)
            .inspect_err(|e| self.report_pipe_error(e))
    }

    /// Whether any job of the given class is still running: operations
    /// only, or all worker-backed jobs.
    pub fn has_active_jobs(&self, important_only: bool) -> bool {
        let registry = self.registry.borrow();
        registry.iter().any(|job| {
            let relevant = if important_only {
                job.kind() == JobKind::Operation
            } else {
                job.kind() != JobKind::Command
            };
            relevant && job.is_running()
        })
    }

    /// Snapshot of the registry for the jobs menu, newest first.
    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.registry.borrow().clone()
    }

    /// Reports an error either to the job bound to the current worker
    /// thread or, on the control thread, through the dialog port.
    pub fn report_error(&self, title: &str, body: &str) {
        if !route_error_to_current_job(body) {
            let _ = self.dialog.prompt(title, body);
        }
    }

    fn report_pipe_error(&self, e: &Error) {
        if let Error::Pipe(which, _) = e {
            let _ = self
                .dialog
                .prompt("File pipe error", &format!("Error creating {which} pipe"));
        }
    }

    /// Spawns and interns an external command job.
    fn launch(
        &self,
        cmd: &str,
        pwd: Option<&Path>,
        flags: JobFlags,
        by: ShellRequester,
    ) -> Result<Arc<Job>> {
        let launched = spawn::launch_external(&self.shell, cmd, pwd, flags, by)
            .inspect_err(|e| self.report_pipe_error(e))?;

        Ok(self.add_job(NewJob {
            kind: JobKind::Command,
            cmd: cmd.to_string(),
            pid: Some(launched.pid),
            child: Some(launched.child),
            err_stream: launched.err_stream,
            input: launched.input,
            output: launched.output,
            with_op: flags.contains(JobFlags::JOB_BAR_VISIBLE),
            #[cfg(windows)]
            job_object: launched.job_object,
        }))
    }

    /// Interns a job at the registry head. Jobs with an error stream are
    /// simultaneously published to the pump: the `erroring` flag and the
    /// pump's use-count reference are materialized here, before any other
    /// thread can see the job.
    fn add_job(&self, spec: NewJob) -> Arc<Job> {
        let has_err_stream = spec.err_stream.is_some();
        let job = Arc::new(Job::new(spec, Arc::clone(&self.shared)));

        if has_err_stream {
            job.mark_erroring();
            if let Ok(mut handoff) = self.shared.handoff.lock() {
                handoff.push(Arc::clone(&job));
            }
            self.shared.handoff_cond.notify_one();
        }

        self.registry.borrow_mut().insert(0, Arc::clone(&job));
        job
    }

    /// Drains and displays a job's pending error output, honoring and
    /// updating its `skip_errors` latch.
    fn show_job_errors(&self, job: &Arc<Job>) {
        while let Some(text) = job.take_new_errors() {
            if !job.skip_errors() {
                let silence = self.dialog.prompt("Background Process Error", &text);
                job.set_skip_errors(silence);
            }
        }
    }

    /// Pokes the pump when at least one job is still being drained, so
    /// stream EOFs are noticed promptly.
    fn maybe_wake_pump(&self) {
        if self.registry.borrow().iter().any(|job| job.is_erroring()) {
            self.shared.wake.signal();
        }
    }

    fn place_on_job_bar(&self, job: &Arc<Job>) {
        debug_assert!(job.has_progress(), "job bar entries carry progress data");
        debug_assert!(!job.on_job_bar(), "job is already on the bar");
        self.shared.job_bar.add(job);
        job.set_on_job_bar(true);
    }

    fn get_off_job_bar(&self, job: &Arc<Job>) {
        debug_assert!(job.on_job_bar(), "job is not on the bar");
        self.shared.job_bar.remove(job);
        job.set_on_job_bar(false);
    }

    /// Publishes the active-job count, scheduling a redraw on change.
    fn set_jobcount(&self, count: i32) {
        let old_count = self.variables.get_int(JOBCOUNT_VAR);
        if count != old_count {
            self.variables.set_int(JOBCOUNT_VAR, count);
            self.redraw.schedule_redraw();
        }
    }
}
