//! fm-jobs: background job engine for an interactive file manager.
//!
//! Three kinds of backgrounded work are tracked as jobs:
//!
//! - external applications run through the user's shell (commands);
//! - threads performing auxiliary work (tasks), like counting the size of
//!   a directory tree;
//! - threads performing important work (operations), like copying or
//!   deleting files.
//!
//! Tasks and operations expose progress for the UI; operations additionally
//! appear on the status-bar job widget. A single pump thread reads the
//! error streams of all command jobs so the host can surface their output
//! from its main thread at its own pace.
//!
//! The host owns one [`Jobs`] instance on its main thread, feeds it
//! collaborator implementations via [`Hooks`], and calls [`Jobs::check`]
//! from its event loop. Design notes and trade-offs are recorded in
//! DESIGN.md.

pub mod error;
pub mod job;
pub mod jobs;
pub mod ports;
pub mod spawn;

mod pump;
mod select;
#[cfg(windows)]
mod win;

pub use error::{Error, Result};
pub use job::{Job, JobKind, OpHandle, Progress, route_error_to_current_job};
pub use jobs::{JOBCOUNT_VAR, Jobs};
pub use ports::{
    Cancellation, ErrorDialog, Hooks, JobBar, NoCancellation, Redraw, ShellRequester, ShellSpec,
    ShellType, Variables,
};
pub use spawn::{Captured, JobFlags, status_to_exit_code};
