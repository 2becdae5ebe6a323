//! End-to-end tests for the job engine.
//!
//! Each test builds an isolated harness with recording stub ports, launches
//! real `sh -c` children (or worker threads) through the public API, and
//! drives reconciliation the way a host event loop would.

#![cfg(unix)]

use std::collections::HashMap;
use std::io::{Read, Seek, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use fm_jobs::{
    ErrorDialog, Hooks, Job, JobBar, JobFlags, JobKind, Jobs, NoCancellation, Redraw,
    ShellRequester, ShellSpec, Variables,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum BarEvent {
    Add,
    Remove,
    Changed(i32),
}

struct StubDialog {
    prompts: Arc<Mutex<Vec<(String, String)>>>,
    silence: Arc<AtomicBool>,
}

impl ErrorDialog for StubDialog {
    fn prompt(&self, title: &str, body: &str) -> bool {
        self.prompts
            .lock()
            .unwrap()
            .push((title.to_string(), body.to_string()));
        self.silence.load(Ordering::Relaxed)
    }
}

struct StubBar {
    events: Arc<Mutex<Vec<BarEvent>>>,
}

impl JobBar for StubBar {
    fn add(&self, _job: &Arc<Job>) {
        self.events.lock().unwrap().push(BarEvent::Add);
    }

    fn remove(&self, _job: &Arc<Job>) {
        self.events.lock().unwrap().push(BarEvent::Remove);
    }

    fn changed(&self, job: &Arc<Job>) {
        let percent = job.progress().map_or(-2, |p| p.percent);
        self.events.lock().unwrap().push(BarEvent::Changed(percent));
    }
}

struct StubVars {
    values: Arc<Mutex<HashMap<String, i32>>>,
}

impl Variables for StubVars {
    fn get_int(&self, name: &str) -> i32 {
        self.values.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    fn set_int(&self, name: &str, value: i32) {
        self.values.lock().unwrap().insert(name.to_string(), value);
    }
}

struct StubRedraw {
    count: Arc<AtomicUsize>,
}

impl Redraw for StubRedraw {
    fn schedule_redraw(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Test harness owning a [`Jobs`] instance plus handles to everything the
/// stub ports record.
struct TestHarness {
    jobs: Jobs,
    prompts: Arc<Mutex<Vec<(String, String)>>>,
    silence: Arc<AtomicBool>,
    bar_events: Arc<Mutex<Vec<BarEvent>>>,
    vars: Arc<Mutex<HashMap<String, i32>>>,
    redraws: Arc<AtomicUsize>,
}

impl TestHarness {
    fn new() -> TestHarness {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            use tracing_subscriber::EnvFilter;
            let _ = tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });

        let prompts = Arc::new(Mutex::new(Vec::new()));
        let silence = Arc::new(AtomicBool::new(false));
        let bar_events = Arc::new(Mutex::new(Vec::new()));
        let vars = Arc::new(Mutex::new(HashMap::new()));
        let redraws = Arc::new(AtomicUsize::new(0));

        let jobs = Jobs::new(Hooks {
            dialog: Box::new(StubDialog {
                prompts: Arc::clone(&prompts),
                silence: Arc::clone(&silence),
            }),
            job_bar: Arc::new(StubBar {
                events: Arc::clone(&bar_events),
            }),
            variables: Box::new(StubVars {
                values: Arc::clone(&vars),
            }),
            redraw: Box::new(StubRedraw {
                count: Arc::clone(&redraws),
            }),
            shell: ShellSpec::default(),
        })
        .expect("job engine starts");

        TestHarness {
            jobs,
            prompts,
            silence,
            bar_events,
            vars,
            redraws,
        }
    }

    fn jobcount(&self) -> i32 {
        self.vars
            .lock()
            .unwrap()
            .get(fm_jobs::JOBCOUNT_VAR)
            .copied()
            .unwrap_or(0)
    }

    fn prompt_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    /// Runs reconciliation until `cond` holds or the timeout elapses.
    fn check_until(&self, show_errors: bool, mut cond: impl FnMut(&TestHarness) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            self.jobs.check(show_errors);
            if cond(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Gives the pump time to drain a finished job's stderr.
    fn drain_errors(&self, job: &Arc<Job>) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while job.wait_errors() {
            assert!(Instant::now() < deadline, "error pump never drained the job");
        }
    }

    fn registry_holds(&self, job: &Arc<Job>) -> bool {
        self.jobs.jobs().iter().any(|j| Arc::ptr_eq(j, job))
    }
}

// ── commands ──────────────────────────────────────────────────────────────────

#[test]
fn clean_run_is_reclaimed() {
    let h = TestHarness::new();
    let job = h
        .jobs
        .run_external_job("true", JobFlags::MENU_VISIBLE, None, None)
        .unwrap();
    assert_eq!(job.kind(), JobKind::Command);

    job.wait().unwrap();
    assert!(!job.is_running());
    assert_eq!(job.exit_code(), Some(0));
    assert!(!job.was_killed());

    h.drain_errors(&job);
    assert_eq!(job.errors(), "");

    // Still referenced by the caller: survives reconciliation.
    h.jobs.check(false);
    assert!(h.registry_holds(&job));

    job.decref();
    h.jobs.check(false);
    assert!(!h.registry_holds(&job));
}

#[test]
fn stderr_reaches_dialog_once() {
    let h = TestHarness::new();
    h.jobs
        .run_external(r"printf 'oops\n' 1>&2", false, false, ShellRequester::ByApp, false)
        .unwrap();

    let job = h.jobs.jobs().into_iter().next().expect("job interned");
    job.incref();

    assert!(h.check_until(true, |h| h.prompt_count() >= 1));
    {
        let prompts = h.prompts.lock().unwrap();
        assert_eq!(
            *prompts,
            vec![("Background Process Error".to_string(), "oops\n".to_string())]
        );
    }
    assert_eq!(job.errors(), "oops\n");

    // The buffer was consumed in one swap; further passes stay quiet.
    h.jobs.check(true);
    h.jobs.check(true);
    assert_eq!(h.prompt_count(), 1);

    job.decref();
}

#[test]
fn silencing_is_per_job() {
    let h = TestHarness::new();
    h.silence.store(true, Ordering::Relaxed);

    h.jobs
        .run_external(r"printf 'first\n' 1>&2", false, false, ShellRequester::ByApp, false)
        .unwrap();
    assert!(h.check_until(true, |h| h.prompt_count() >= 1));
    let after_first = h.prompt_count();

    // The silence latch belongs to the first job only; a fresh job prompts
    // again.
    h.jobs
        .run_external(r"printf 'second\n' 1>&2", false, false, ShellRequester::ByApp, false)
        .unwrap();
    assert!(h.check_until(true, |h| h.prompt_count() > after_first));
}

#[test]
fn soft_then_hard_cancel() {
    let h = TestHarness::new();
    let job = h
        .jobs
        .run_external_job("exec sleep 30", JobFlags::MENU_VISIBLE, None, None)
        .unwrap();

    assert!(job.cancel(), "first cancel reports a state change");
    assert!(job.cancelled());
    assert!(!job.cancel(), "second cancel reports already-cancelled");

    // Give the interrupt a moment; escalate if the child ignored it.
    let deadline = Instant::now() + Duration::from_millis(200);
    while job.is_running() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    if job.is_running() {
        job.terminate();
    }

    job.wait().unwrap();
    assert!(job.was_killed());
    assert!(job.exit_code().unwrap() >= 128);

    h.drain_errors(&job);
    job.decref();
    h.jobs.check(false);
    assert!(!h.registry_holds(&job));
}

#[test]
fn refcount_keeps_finished_job() {
    let h = TestHarness::new();
    let job = h
        .jobs
        .run_external_job("true", JobFlags::MENU_VISIBLE, None, None)
        .unwrap();

    job.incref(); // one extra on top of the handle's reference
    job.wait().unwrap();
    h.drain_errors(&job);

    h.jobs.check(false);
    assert!(h.registry_holds(&job), "use_count > 0 blocks reclamation");

    job.decref();
    h.jobs.check(false);
    assert!(h.registry_holds(&job), "handle reference still outstanding");

    job.decref();
    h.jobs.check(false);
    assert!(!h.registry_holds(&job));
}

#[test]
fn captured_output_is_readable() {
    let h = TestHarness::new();
    let job = h
        .jobs
        .run_external_job(
            "printf xyz",
            JobFlags::CAPTURE_OUT | JobFlags::MENU_VISIBLE,
            None,
            None,
        )
        .unwrap();

    let mut output = job.take_output().expect("stdout was captured");
    let mut text = String::new();
    output.read_to_string(&mut text).unwrap();
    assert_eq!(text, "xyz");

    job.wait().unwrap();
    assert_eq!(job.exit_code(), Some(0));
    h.drain_errors(&job);
    job.decref();
}

#[test]
fn merged_streams_share_the_output_pipe() {
    let h = TestHarness::new();
    let job = h
        .jobs
        .run_external_job(
            "printf out; printf err 1>&2",
            JobFlags::CAPTURE_OUT | JobFlags::MERGE_STREAMS | JobFlags::MENU_VISIBLE,
            None,
            None,
        )
        .unwrap();

    let mut output = job.take_output().expect("stdout was captured");
    let mut text = String::new();
    output.read_to_string(&mut text).unwrap();
    assert_eq!(text, "outerr");

    job.wait().unwrap();
    // No separate error stream exists: nothing to drain, nothing recorded.
    assert!(!job.wait_errors());
    assert_eq!(job.errors(), "");
    job.decref();
}

#[test]
fn supplied_input_feeds_the_child() {
    let h = TestHarness::new();
    let input = h
        .jobs
        .run_external("cat > /dev/null", false, true, ShellRequester::ByApp, true)
        .unwrap()
        .expect("stdin pipe requested");

    (&input).write_all(b"some bytes\n").unwrap();
    drop(input); // EOF lets cat exit

    assert!(h.check_until(false, |h| h.jobs.jobs().is_empty()));
}

#[test]
fn bad_working_directory_fails_deterministically() {
    let h = TestHarness::new();
    let result = h.jobs.run_external_job(
        "true",
        JobFlags::MENU_VISIBLE,
        None,
        Some(std::path::Path::new("/no/such/dir")),
    );
    assert!(matches!(result, Err(fm_jobs::Error::BadWorkingDir(_))));
}

#[test]
fn command_with_descr_lands_on_job_bar() {
    let h = TestHarness::new();
    let job = h
        .jobs
        .run_external_job(
            "exec sleep 30",
            JobFlags::JOB_BAR_VISIBLE | JobFlags::MENU_VISIBLE,
            Some("sleeping"),
            None,
        )
        .unwrap();

    assert!(job.on_job_bar());
    assert_eq!(job.progress().unwrap().descr, "sleeping");
    {
        let events = h.bar_events.lock().unwrap();
        // Description is applied before the bar sees the job.
        assert_eq!(events.first(), Some(&BarEvent::Changed(-1)));
        assert!(events.contains(&BarEvent::Add));
    }

    job.terminate();
    job.wait().unwrap();
    h.drain_errors(&job);
    job.decref();
    h.jobs.check(false);

    assert!(!job.on_job_bar());
    assert_eq!(h.bar_events.lock().unwrap().last(), Some(&BarEvent::Remove));
}

// ── workers ───────────────────────────────────────────────────────────────────

#[test]
fn operation_reports_monotone_progress() {
    let h = TestHarness::new();
    h.jobs
        .execute("counting", "count items", 10, true, |op| {
            for done in 1..=10 {
                op.set_progress(10, done);
                std::thread::sleep(Duration::from_millis(5));
            }
        })
        .unwrap();

    let job = h.jobs.jobs().into_iter().next().expect("job interned");
    job.incref();
    assert_eq!(job.kind(), JobKind::Operation);

    let mut saw_running_count = false;
    assert!(h.check_until(false, |h| {
        saw_running_count |= h.jobcount() == 1;
        !h.jobs.has_active_jobs(true)
    }));
    assert!(saw_running_count, "running operation was published");

    assert_eq!(job.exit_code(), Some(0));
    assert_eq!(h.jobcount(), 0);
    assert!(h.redraws.load(Ordering::Relaxed) >= 2);

    let events = h.bar_events.lock().unwrap().clone();
    assert_eq!(events.first(), Some(&BarEvent::Add));
    assert_eq!(events.last(), Some(&BarEvent::Remove));
    let percents: Vec<i32> = events
        .iter()
        .filter_map(|e| match e {
            BarEvent::Changed(p) => Some(*p),
            _ => None,
        })
        .collect();
    assert_eq!(percents.last(), Some(&100));
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");

    job.decref();
    h.jobs.check(false);
    assert!(!h.registry_holds(&job));
}

#[test]
fn worker_cancellation_is_cooperative() {
    let h = TestHarness::new();
    h.jobs
        .execute("spinning", "spin until told", 0, false, |op| {
            while !op.cancelled() {
                std::thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();

    let job = h.jobs.jobs().into_iter().next().expect("job interned");
    job.incref();
    assert_eq!(job.kind(), JobKind::Task);
    assert!(h.jobs.has_active_jobs(false));
    assert!(!h.jobs.has_active_jobs(true), "a task is not an operation");

    assert!(job.cancel());
    assert!(job.cancelled());

    assert!(h.check_until(false, |_| job.exit_code() == Some(0)));

    job.decref();
    h.jobs.check(false);
    assert!(!h.registry_holds(&job));
}

#[test]
fn exit_callback_runs_exactly_once() {
    let h = TestHarness::new();
    let job = h
        .jobs
        .run_external_job("true", JobFlags::MENU_VISIBLE, None, None)
        .unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_in_cb = Arc::clone(&fired);
    job.set_exit_cb(move |_| {
        fired_in_cb.fetch_add(1, Ordering::Relaxed);
    });

    job.wait().unwrap();
    h.drain_errors(&job);

    h.jobs.check(false);
    h.jobs.check(false);
    assert_eq!(fired.load(Ordering::Relaxed), 1);

    job.decref();
    h.jobs.check(false);
    assert!(!h.registry_holds(&job));
    assert_eq!(fired.load(Ordering::Relaxed), 1);
}

#[test]
fn jobcount_ignores_menu_hidden_jobs() {
    let h = TestHarness::new();
    let job = h
        .jobs
        .run_external_job("exec sleep 30", JobFlags::empty(), None, None)
        .unwrap();

    h.jobs.check(false);
    assert_eq!(h.jobcount(), 0);

    job.terminate();
    job.wait().unwrap();
    h.drain_errors(&job);
    job.decref();
    h.jobs.check(false);
    assert!(!h.registry_holds(&job));
}

// ── synchronous helpers ───────────────────────────────────────────────────────

#[test]
fn and_wait_for_errors_returns_exit_code() {
    let h = TestHarness::new();
    assert_eq!(h.jobs.and_wait_for_errors("exit 7", &NoCancellation), 7);
    assert_eq!(h.prompt_count(), 0);
}

#[test]
fn and_wait_for_errors_reports_stderr() {
    let h = TestHarness::new();
    let code = h
        .jobs
        .and_wait_for_errors(r"printf 'bad\n' 1>&2; exit 1", &NoCancellation);
    assert_eq!(code, -1);

    let prompts = h.prompts.lock().unwrap();
    assert_eq!(
        *prompts,
        vec![("Background Process Error".to_string(), "bad\n".to_string())]
    );
}

#[test]
fn run_and_capture_roundtrip() {
    let h = TestHarness::new();

    let cap = h
        .jobs
        .run_and_capture("printf hello", false, None, true, false)
        .unwrap();
    let mut stdout = cap.stdout.expect("stdout captured");
    let mut text = String::new();
    stdout.read_to_string(&mut text).unwrap();
    assert_eq!(text, "hello");
    let mut child = cap.child;
    assert_eq!(child.wait().unwrap().code(), Some(0));

    // Feed stdin from a real file, the way filter commands do.
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(b"line one\n").unwrap();
    file.rewind().unwrap();

    let cap = h
        .jobs
        .run_and_capture("cat", false, Some(file), true, false)
        .unwrap();
    let mut stdout = cap.stdout.expect("stdout captured");
    let mut text = String::new();
    stdout.read_to_string(&mut text).unwrap();
    assert_eq!(text, "line one\n");
    let mut child = cap.child;
    assert_eq!(child.wait().unwrap().code(), Some(0));
}
