//! Interfaces to the host application.
//!
//! The job engine never draws anything itself. Dialogs, the status-bar job
//! widget, builtin variables and redraw scheduling all belong to the host
//! and are reached through the traits below. The host hands implementations
//! to [`Jobs::new`](crate::Jobs::new) once, bundled in [`Hooks`].

use std::process::Command;
use std::sync::Arc;

use crate::job::Job;

/// Modal error reporting.
///
/// Called on the control thread only. The return value tells the engine
/// whether the user asked to silence further messages from the same job.
pub trait ErrorDialog {
    fn prompt(&self, title: &str, body: &str) -> bool;
}

/// The status-bar widget that lists important operations.
///
/// `changed` is invoked from worker threads whenever a job's progress tuple
/// is updated, so implementations must be thread-safe. `add`/`remove` come
/// from the control thread only.
pub trait JobBar: Send + Sync {
    fn add(&self, job: &Arc<Job>);
    fn remove(&self, job: &Arc<Job>);
    fn changed(&self, job: &Arc<Job>);
}

/// Builtin-variable store of the host (`v:jobcount` lives here).
pub trait Variables {
    fn get_int(&self, name: &str) -> i32;
    fn set_int(&self, name: &str, value: i32);
}

/// Lets the engine request a UI refresh after state it publishes changes.
pub trait Redraw {
    fn schedule_redraw(&self);
}

/// Cancellation source for synchronous helpers such as
/// [`Jobs::and_wait_for_errors`](crate::Jobs::and_wait_for_errors).
pub trait Cancellation: Sync {
    fn requested(&self) -> bool;
}

/// A cancellation source that never fires.
pub struct NoCancellation;

impl Cancellation for NoCancellation {
    fn requested(&self) -> bool {
        false
    }
}

/// Who asked for a shell command to be run.
///
/// User-issued commands go through the user's configured shell flag (which
/// may enable interactive quirks); app-issued ones always use the plain
/// non-interactive flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellRequester {
    ByUser,
    ByApp,
}

/// Flavor of the configured shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellType {
    /// POSIX-style shell (`sh`, `bash`, ...), takes `-c`.
    Posix,
    /// Windows `cmd.exe`, takes `/C`.
    Cmd,
}

/// Shell configuration supplied by the host's config layer.
#[derive(Debug, Clone)]
pub struct ShellSpec {
    /// Path to the shell binary.
    pub shell: String,
    /// Flag used for commands issued by the user (e.g. `-c` or `-ic`).
    pub shell_flag: String,
    /// What kind of shell this is.
    pub shell_type: ShellType,
}

impl ShellSpec {
    /// The flag to pass for the given requester.
    fn flag_for(&self, by: ShellRequester) -> &str {
        match by {
            ShellRequester::ByUser => &self.shell_flag,
            ShellRequester::ByApp => match self.shell_type {
                ShellType::Posix => "-c",
                ShellType::Cmd => "/C",
            },
        }
    }

    /// Builds the `shell <flag> <cmd>` command line.
    pub(crate) fn command(&self, cmd: &str, by: ShellRequester) -> Command {
        let mut command = Command::new(&self.shell);
        command.arg(self.flag_for(by)).arg(cmd);
        command
    }
}

impl Default for ShellSpec {
    #[cfg(unix)]
    fn default() -> Self {
        ShellSpec {
            shell: "/bin/sh".to_string(),
            shell_flag: "-c".to_string(),
            shell_type: ShellType::Posix,
        }
    }

    #[cfg(windows)]
    fn default() -> Self {
        ShellSpec {
            shell: "cmd".to_string(),
            shell_flag: "/C".to_string(),
            shell_type: ShellType::Cmd,
        }
    }
}

/// Everything the engine needs from the host, handed over once at startup.
pub struct Hooks {
    pub dialog: Box<dyn ErrorDialog>,
    pub job_bar: Arc<dyn JobBar>,
    pub variables: Box<dyn Variables>,
    pub redraw: Box<dyn Redraw>,
    pub shell: ShellSpec,
}
