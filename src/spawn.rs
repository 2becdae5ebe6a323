//! Child-process spawning with stdio redirections.
//!
//! Both platform families go through `std::process::Command`; the
//! differences are confined to a `pre_exec` session setup on POSIX and
//! creation flags plus a Job Object on Windows. Pipes are created
//! explicitly so that stream merging and parent-side ownership stay
//! uniform across platforms.

use std::io::{self, PipeReader, PipeWriter};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};

use bitflags::bitflags;
use tracing::debug;

use crate::ports::{ShellRequester, ShellSpec};
#[cfg(windows)]
use crate::win::JobObject;
use crate::{Error, Result};

bitflags! {
    /// How an external command job is wired up and where it shows up.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct JobFlags: u32 {
        /// Keep the child attached to the session/console instead of
        /// detaching it into its own.
        const KEEP_IN_FG = 1 << 0;
        /// Wire a pipe to the child's stdin and hand its write end back.
        const SUPPLY_INPUT = 1 << 1;
        /// Wire a pipe to the child's stdout and hand its read end back.
        const CAPTURE_OUT = 1 << 2;
        /// Send stderr into the stdout pipe (only meaningful with
        /// `CAPTURE_OUT`); the job then has no separate error stream.
        const MERGE_STREAMS = 1 << 3;
        /// Show the job on the status-bar job widget.
        const JOB_BAR_VISIBLE = 1 << 4;
        /// List the job in the jobs menu.
        const MENU_VISIBLE = 1 << 5;
    }
}

/// A spawned child with the parent-side pipe ends that were requested.
pub(crate) struct Launched {
    pub child: Child,
    pub pid: u32,
    pub input: Option<PipeWriter>,
    pub output: Option<PipeReader>,
    pub err_stream: Option<PipeReader>,
    #[cfg(windows)]
    pub job_object: Option<JobObject>,
}

/// Maps a raw exit status onto the single code a job records: normal exit
/// keeps its code, a signalled death becomes `128 + signum`, anything
/// unrecognizable becomes 1.
pub fn status_to_exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt as _;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Whether `pwd` can be used as a child's working directory.
fn traversable(pwd: &Path) -> bool {
    if !pwd.is_dir() {
        return false;
    }
    #[cfg(unix)]
    {
        nix::unistd::access(pwd, nix::unistd::AccessFlags::X_OK).is_ok()
    }
    #[cfg(windows)]
    {
        true
    }
}

/// Spawns `cmd` through the configured shell with the redirections the
/// flags ask for.
///
/// Stream wiring:
/// - stdin: pipe write end returned when `SUPPLY_INPUT`, null device
///   otherwise;
/// - stdout: pipe read end returned when `CAPTURE_OUT`, null device
///   otherwise;
/// - stderr: always a pipe whose read end feeds the error pump, except
///   under `CAPTURE_OUT | MERGE_STREAMS` where stderr shares the stdout
///   pipe and no error stream exists.
///
/// Unless `KEEP_IN_FG`, the child is detached from the UI's terminal
/// session so it cannot compete for input.
pub(crate) fn launch_external(
    shell: &ShellSpec,
    cmd: &str,
    pwd: Option<&Path>,
    flags: JobFlags,
    by: ShellRequester,
) -> Result<Launched> {
    let supply_input = flags.contains(JobFlags::SUPPLY_INPUT);
    let capture_output = flags.contains(JobFlags::CAPTURE_OUT);
    let merge_streams = capture_output && flags.contains(JobFlags::MERGE_STREAMS);

    if let Some(pwd) = pwd {
        // Process creation on Windows rejects a bad working directory up
        // front; pre-checking keeps the POSIX path equally deterministic.
        if !traversable(pwd) {
            return Err(Error::BadWorkingDir(pwd.to_path_buf()));
        }
    }

    let mut command = shell.command(cmd, by);
    if let Some(pwd) = pwd {
        command.current_dir(pwd);
    }

    let input = if supply_input {
        let (rd, wr) = io::pipe().map_err(|e| Error::Pipe("input", e))?;
        command.stdin(rd);
        Some(wr)
    } else {
        command.stdin(Stdio::null());
        None
    };

    let (output, err_stream) = if capture_output {
        let (rd, wr) = io::pipe().map_err(|e| Error::Pipe("output", e))?;
        if merge_streams {
            let wr_err = wr.try_clone().map_err(|e| Error::Pipe("output", e))?;
            command.stdout(wr);
            command.stderr(wr_err);
            (Some(rd), None)
        } else {
            command.stdout(wr);
            let (err_rd, err_wr) = io::pipe().map_err(|e| Error::Pipe("error", e))?;
            command.stderr(err_wr);
            (Some(rd), Some(err_rd))
        }
    } else {
        command.stdout(Stdio::null());
        let (err_rd, err_wr) = io::pipe().map_err(|e| Error::Pipe("error", e))?;
        command.stderr(err_wr);
        (None, Some(err_rd))
    };

    #[cfg(unix)]
    if !flags.contains(JobFlags::KEEP_IN_FG) {
        use std::os::unix::process::CommandExt as _;
        // SAFETY: setsid is async-signal-safe and touches no state shared
        // with the parent.
        unsafe {
            command.pre_exec(|| {
                if unsafe { libc::setsid() } == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt as _;
        use windows::Win32::System::Threading::{CREATE_NEW_PROCESS_GROUP, CREATE_NO_WINDOW};

        // A dedicated process group makes CTRL_BREAK deliverable to the
        // child without hitting the file manager itself.
        let mut creation_flags = CREATE_NEW_PROCESS_GROUP.0;
        if !flags.contains(JobFlags::KEEP_IN_FG) {
            creation_flags |= CREATE_NO_WINDOW.0;
        }
        command.creation_flags(creation_flags);
    }

    let child = command.spawn().map_err(|e| Error::Spawn {
        cmd: cmd.to_string(),
        source: e,
    })?;
    let pid = child.id();

    #[cfg(windows)]
    let job_object = JobObject::for_child(&child).ok();

    debug!(pid, cmd, "spawned background command");

    Ok(Launched {
        child,
        pid,
        input,
        output,
        err_stream,
        #[cfg(windows)]
        job_object,
    })
}

/// A synchronously spawned command with whatever streams were captured.
/// Unlike background jobs, these children are not tracked by the registry;
/// the caller reads the streams and waits on `child` itself.
pub struct Captured {
    pub pid: u32,
    pub child: Child,
    pub stdout: Option<PipeReader>,
    pub stderr: Option<PipeReader>,
}

/// Spawns `cmd` with optional stream capture. Streams that are not
/// captured are inherited from the parent; `stdin` replaces the child's
/// input when given.
pub(crate) fn run_and_capture(
    shell: &ShellSpec,
    cmd: &str,
    user_sh: bool,
    stdin: Option<std::fs::File>,
    want_stdout: bool,
    want_stderr: bool,
) -> Result<Captured> {
    let by = if user_sh {
        ShellRequester::ByUser
    } else {
        ShellRequester::ByApp
    };
    let mut command = shell.command(cmd, by);

    if let Some(file) = stdin {
        command.stdin(file);
    }

    let stdout = if want_stdout {
        let (rd, wr) = io::pipe().map_err(|e| Error::Pipe("output", e))?;
        command.stdout(wr);
        Some(rd)
    } else {
        None
    };
    let stderr = if want_stderr {
        let (rd, wr) = io::pipe().map_err(|e| Error::Pipe("error", e))?;
        command.stderr(wr);
        Some(rd)
    } else {
        None
    };

    let child = command.spawn().map_err(|e| Error::Spawn {
        cmd: cmd.to_string(),
        source: e,
    })?;
    let pid = child.id();
    debug!(pid, cmd, "spawned captured command");

    Ok(Captured {
        pid,
        child,
        stdout,
        stderr,
    })
}
