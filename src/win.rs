//! Windows process-tree management.
//!
//! Every command job gets its own Job Object so that `terminate` takes the
//! whole process tree down with one call, and so that nothing outlives the
//! file manager if it dies (`KILL_ON_JOB_CLOSE`).

use std::io;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
use std::process::Child;

use tracing::warn;
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::Console::{CTRL_BREAK_EVENT, GenerateConsoleCtrlEvent};
use windows::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
    JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JobObjectExtendedLimitInformation,
    SetInformationJobObject, TerminateJobObject,
};

fn to_io(err: &windows::core::Error) -> io::Error {
    io::Error::from_raw_os_error(err.code().0)
}

/// A Job Object holding exactly one child (and whatever that child spawns).
pub(crate) struct JobObject(OwnedHandle);

// SAFETY: a Job Object handle is a pointer-sized token; the kernel object
// behind it supports concurrent access.
unsafe impl Send for JobObject {}
unsafe impl Sync for JobObject {}

impl JobObject {
    /// Creates a Job Object with `KILL_ON_JOB_CLOSE` and assigns the child
    /// to it.
    pub(crate) fn for_child(child: &Child) -> io::Result<JobObject> {
        // SAFETY: all handles passed below are either freshly created here
        // or owned by `child`, which outlives the calls.
        unsafe {
            let job = CreateJobObjectW(None, None).map_err(|e| to_io(&e))?;

            let mut info = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();
            info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
            if let Err(e) = SetInformationJobObject(
                job,
                JobObjectExtendedLimitInformation,
                (&raw const info).cast(),
                std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            ) {
                let _ = CloseHandle(job);
                return Err(to_io(&e));
            }

            if let Err(e) = AssignProcessToJobObject(job, HANDLE(child.as_raw_handle())) {
                // Assignment fails when the child already sits in another
                // job (nested CI environments). The handle is useless then;
                // close it and report that no Job Object is available. The
                // spawn path downgrades this to `None`, and terminating the
                // job kills the child process alone instead of a tree.
                let _ = CloseHandle(job);
                return Err(to_io(&e));
            }

            Ok(JobObject(OwnedHandle::from_raw_handle(
                job.0 as RawHandle,
            )))
        }
    }

    /// Kills every process in the job; idempotent.
    pub(crate) fn terminate(&self, exit_code: u32) {
        // SAFETY: the handle is owned and stays valid for the call.
        let terminated = unsafe {
            TerminateJobObject(HANDLE(self.0.as_raw_handle()), exit_code)
        };
        if let Err(e) = terminated {
            warn!(error = %e.message(), "TerminateJobObject failed");
        }
    }
}

/// Asks the process group to stop by delivering CTRL_BREAK.
///
/// This is the soft "cancel" path; console-less children may ignore it, in
/// which case callers escalate to [`JobObject::terminate`].
pub(crate) fn cancel_process(pid: u32) -> io::Result<()> {
    // SAFETY: GenerateConsoleCtrlEvent accepts any process-group id; the
    // child was started in its own group.
    unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid).map_err(|e| to_io(&e)) }
}
