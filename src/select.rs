//! Readiness multiplexing for the error pump.
//!
//! [`Selector`] answers "which of these pipe read ends have data (or are
//! closed)?" with a bounded wait. [`WakeEvent`] is a self-pipe the control
//! thread writes to when it wants the pump to rebuild its job list without
//! waiting out the poll timeout.
//!
//! On POSIX this is a plain `poll(2)` over the raw descriptors. Windows
//! anonymous pipes cannot be waited on directly, so the selector polls
//! `PeekNamedPipe` in small sleep slices instead; a broken pipe counts as
//! ready so the subsequent read observes EOF.

use std::io::{self, PipeReader, PipeWriter, Read, Write};
use std::time::Duration;

#[cfg(unix)]
use std::os::fd::{AsRawFd, RawFd};
#[cfg(windows)]
use std::os::windows::io::{AsRawHandle, RawHandle};

/// Raw handle type the selector watches.
#[cfg(unix)]
pub(crate) type WaitHandle = RawFd;
#[cfg(windows)]
pub(crate) type WaitHandle = RawHandle;

/// The raw handle of a pipe read end.
pub(crate) fn stream_handle(stream: &PipeReader) -> WaitHandle {
    #[cfg(unix)]
    {
        stream.as_raw_fd()
    }
    #[cfg(windows)]
    {
        stream.as_raw_handle()
    }
}

/// Watch list over pipe read ends, rebuilt by the pump on every round.
pub(crate) struct Selector {
    #[cfg(unix)]
    fds: Vec<libc::pollfd>,
    #[cfg(windows)]
    handles: Vec<(RawHandle, bool)>,
}

impl Selector {
    pub(crate) fn new() -> Selector {
        Selector {
            #[cfg(unix)]
            fds: Vec::new(),
            #[cfg(windows)]
            handles: Vec::new(),
        }
    }

    /// Drops all watched handles.
    pub(crate) fn reset(&mut self) {
        #[cfg(unix)]
        self.fds.clear();
        #[cfg(windows)]
        self.handles.clear();
    }

    /// Adds a handle to the watch list.
    pub(crate) fn add(&mut self, handle: WaitHandle) {
        #[cfg(unix)]
        self.fds.push(libc::pollfd {
            fd: handle,
            events: libc::POLLIN,
            revents: 0,
        });
        #[cfg(windows)]
        self.handles.push((handle, false));
    }

    /// Waits until at least one handle is ready or the timeout elapses.
    /// Returns whether anything became ready.
    #[cfg(unix)]
    pub(crate) fn wait(&mut self, timeout: Duration) -> bool {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        loop {
            // SAFETY: fds points at a live array of self.fds.len() entries
            // for the duration of the call.
            let rc = unsafe {
                libc::poll(
                    self.fds.as_mut_ptr(),
                    self.fds.len() as libc::nfds_t,
                    timeout_ms,
                )
            };
            if rc >= 0 {
                return rc > 0;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return false;
            }
            // Interrupted by a signal: retry with the full timeout. The
            // pump tolerates waits longer than requested.
        }
    }

    /// See the POSIX version. Polls `PeekNamedPipe` in 10 ms slices.
    #[cfg(windows)]
    pub(crate) fn wait(&mut self, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        loop {
            let mut any = false;
            for (handle, ready) in &mut self.handles {
                *ready = pipe_readable(*handle);
                any |= *ready;
            }
            if any {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Whether the given handle was ready after the last [`wait`](Self::wait).
    pub(crate) fn is_ready(&self, handle: WaitHandle) -> bool {
        #[cfg(unix)]
        {
            self.fds.iter().any(|p| {
                p.fd == handle
                    && (p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR)) != 0
            })
        }
        #[cfg(windows)]
        {
            self.handles.iter().any(|&(h, ready)| h == handle && ready)
        }
    }
}

/// `true` when a read on the pipe would not block: either bytes are
/// buffered or the write end is gone (read observes EOF/error).
#[cfg(windows)]
fn pipe_readable(handle: RawHandle) -> bool {
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::Pipes::PeekNamedPipe;

    let mut avail: u32 = 0;
    // SAFETY: handle is a live pipe handle owned by a job the pump holds a
    // reference to; the out pointer is valid for the call.
    let peeked = unsafe { PeekNamedPipe(HANDLE(handle), None, 0, None, Some(&mut avail), None) };
    match peeked {
        Ok(()) => avail > 0,
        // Broken pipe and friends: let the reader run into the error.
        Err(_) => true,
    }
}

/// One-shot wake-up channel built on an anonymous pipe.
///
/// `signal` is callable from any thread; `reset` drains pending bytes so the
/// next wait does not fire spuriously.
pub(crate) struct WakeEvent {
    rd: PipeReader,
    wr: PipeWriter,
}

impl WakeEvent {
    pub(crate) fn new() -> io::Result<WakeEvent> {
        let (rd, wr) = io::pipe()?;
        #[cfg(unix)]
        {
            set_nonblocking(rd.as_raw_fd())?;
            set_nonblocking(wr.as_raw_fd())?;
        }
        Ok(WakeEvent { rd, wr })
    }

    /// Makes the next (or current) selector wait report the event as ready.
    pub(crate) fn signal(&self) {
        // A full pipe means plenty of unconsumed signals already; dropping
        // this one loses nothing.
        let _ = (&self.wr).write(&[1u8]);
    }

    /// Consumes all pending signals.
    pub(crate) fn reset(&self) {
        let mut buf = [0u8; 64];
        #[cfg(unix)]
        loop {
            match (&self.rd).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        #[cfg(windows)]
        {
            // The read end is blocking on Windows; only consume what is
            // known to be buffered.
            while pipe_readable(self.rd.as_raw_handle()) {
                if (&self.rd).read(&mut buf).unwrap_or(0) == 0 {
                    break;
                }
            }
        }
    }

    /// Handle to register with a [`Selector`].
    pub(crate) fn wait_handle(&self) -> WaitHandle {
        #[cfg(unix)]
        {
            self.rd.as_raw_fd()
        }
        #[cfg(windows)]
        {
            self.rd.as_raw_handle()
        }
    }
}

#[cfg(unix)]
fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fd is a valid descriptor owned by the calling WakeEvent.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: same descriptor, flags derived from F_GETFL above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
