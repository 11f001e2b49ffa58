//! Byte pumps between two descriptors.
//!
//! A copier is an OS thread that polls its source together with the read
//! end of a private shutdown pipe. Dropping the write end wakes the thread
//! wherever it is blocked, so stopping never waits on the peer.

use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use std::thread::JoinHandle;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::unistd::pipe2;
use ocishim_shared::errors::{ShimError, ShimResult};

const COPY_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug)]
pub(crate) struct Copier {
    name: &'static str,
    shutdown: Option<OwnedFd>,
    handle: Option<JoinHandle<()>>,
}

impl Copier {
    /// Start copying `src` into `dst` until `src` ends or the copier stops.
    ///
    /// The thread owns its clones of both files; a pipe write end passed as
    /// `dst` is closed as soon as the thread returns.
    pub(crate) fn spawn(name: &'static str, src: Arc<File>, dst: Arc<File>) -> ShimResult<Self> {
        let (shutdown_rx, shutdown_tx) = pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| ShimError::Io(format!("failed to create shutdown pipe: {}", e)))?;

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                if let Err(e) = copy_until_shutdown(&src, &dst, &shutdown_rx) {
                    tracing::debug!(thread = name, error = %e, "Copy stopped");
                }
            })
            .map_err(|e| ShimError::Io(format!("failed to spawn {} thread: {}", name, e)))?;

        Ok(Self {
            name,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Wake the thread and wait for it. Later calls do nothing.
    pub(crate) fn stop(&mut self) {
        drop(self.shutdown.take());
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::warn!(thread = self.name, "Copy thread panicked");
        }
    }
}

impl Drop for Copier {
    fn drop(&mut self) {
        self.stop();
    }
}

fn copy_until_shutdown(src: &File, dst: &File, shutdown: &OwnedFd) -> io::Result<()> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        if !wait_ready(src, PollFlags::POLLIN, shutdown)? {
            return Ok(());
        }

        let n = match (&*src).read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
            // A pty master reports EIO once every slave descriptor is closed.
            Err(e) if e.raw_os_error() == Some(libc::EIO) => return Ok(()),
            Err(e) => return Err(e),
        };

        if !write_all_until_shutdown(dst, &buf[..n], shutdown)? {
            return Ok(());
        }
    }
}

/// `write_all` that gives up when the shutdown pipe fires. `dst` may be
/// non-blocking.
fn write_all_until_shutdown(dst: &File, mut data: &[u8], shutdown: &OwnedFd) -> io::Result<bool> {
    while !data.is_empty() {
        match (&*dst).write(data) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if !wait_ready(dst, PollFlags::POLLOUT, shutdown)? {
                    return Ok(false);
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Block until `file` reports any of `events` (or an error condition).
/// `false` when the shutdown pipe fired first.
fn wait_ready(file: &File, events: PollFlags, shutdown: &OwnedFd) -> io::Result<bool> {
    loop {
        let mut fds = [
            PollFd::new(file.as_fd(), events),
            PollFd::new(shutdown.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }

        if fds[1].revents().is_some_and(|r| !r.is_empty()) {
            return Ok(false);
        }
        if fds[0].revents().is_some_and(|r| !r.is_empty()) {
            return Ok(true);
        }
    }
}
