//! Pseudo-terminal bridge for processes started with a terminal.
//!
//! The runtime is handed the slave path. One copier moves bytes from the
//! stdin endpoint to the master, another from the master to the stdout
//! endpoint.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::pty::{Winsize, grantpt, posix_openpt, ptsname_r, unlockpt};
use ocishim_shared::errors::{ShimError, ShimResult};

use super::copy::Copier;

/// End-of-transmission; a canonical-mode reader sees it as end of file.
const EOT: u8 = 0x04;

pub(crate) struct Console {
    path: PathBuf,
    master: Arc<File>,
    /// Held open so the master never sees a hangup before the runtime opens
    /// the slave.
    _slave: File,
    stdin_copy: Option<Copier>,
    stdout_copy: Option<Copier>,
}

impl Console {
    /// Allocate a pty pair and start the copiers.
    ///
    /// `stdin` feeds the master; master output is written to `stdout`.
    pub(crate) fn open(stdin: Option<Arc<File>>, stdout: Option<Arc<File>>) -> ShimResult<Self> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC)
            .map_err(|e| ShimError::Io(format!("failed to allocate pty: {}", e)))?;
        grantpt(&master).map_err(|e| ShimError::Io(format!("grantpt failed: {}", e)))?;
        unlockpt(&master).map_err(|e| ShimError::Io(format!("unlockpt failed: {}", e)))?;
        let path = PathBuf::from(
            ptsname_r(&master).map_err(|e| ShimError::Io(format!("ptsname failed: {}", e)))?,
        );
        // Writes must not block a copier that is being stopped.
        fcntl(&master, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .map_err(|e| ShimError::Io(format!("failed to set pty non-blocking: {}", e)))?;
        let master = Arc::new(File::from(OwnedFd::from(master)));

        let slave = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_CLOEXEC)
            .open(&path)
            .map_err(|e| {
                ShimError::Io(format!("failed to open console {}: {}", path.display(), e))
            })?;

        let mut console = Self {
            path,
            master,
            _slave: slave,
            stdin_copy: None,
            stdout_copy: None,
        };

        // On a spawn failure `console` drops here, which stops any copier
        // already running and closes the master.
        if let Some(stdin) = stdin {
            console.stdin_copy = Some(Copier::spawn(
                "console-stdin",
                stdin,
                console.master.clone(),
            )?);
        }
        if let Some(stdout) = stdout {
            console.stdout_copy = Some(Copier::spawn(
                "console-stdout",
                console.master.clone(),
                stdout,
            )?);
        }

        tracing::debug!(console = %console.path.display(), "Console attached");
        Ok(console)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Stop forwarding stdin and send end-of-file to the terminal.
    pub(crate) fn close_stdin(&mut self) -> ShimResult<()> {
        if let Some(mut copier) = self.stdin_copy.take() {
            copier.stop();
        }
        match (&*self.master).write(&[EOT]) {
            Ok(_) => Ok(()),
            // Input queue full: the reader has not drained it yet.
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(ShimError::Io(format!(
                "failed to send EOF to console {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    /// Set the terminal window size.
    pub(crate) fn resize(&self, width: u16, height: u16) -> ShimResult<()> {
        let winsize = Winsize {
            ws_row: height,
            ws_col: width,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCSWINSZ reads one winsize from a valid pointer.
        let ret = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &winsize) };
        if ret < 0 {
            return Err(ShimError::Io(format!(
                "failed to resize console {}: {}",
                self.path.display(),
                std::io::Error::last_os_error()
            )));
        }
        tracing::debug!(console = %self.path.display(), width, height, "Console resized");
        Ok(())
    }

    /// Stop the copiers and wait for them.
    pub(crate) fn close(&mut self) {
        if let Some(mut copier) = self.stdin_copy.take() {
            copier.stop();
        }
        if let Some(mut copier) = self.stdout_copy.take() {
            copier.stop();
        }
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console")
            .field("path", &self.path)
            .field("stdin", &self.stdin_copy.is_some())
            .field("stdout", &self.stdout_copy.is_some())
            .finish()
    }
}
