//! Stdio and console wiring for one process.

mod console;
mod copy;
mod stdio;

pub use stdio::RuntimeStdio;

use std::fs::File;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use ocishim_shared::errors::{ShimError, ShimResult};

use crate::runtime::options::StdioPaths;
use console::Console;
use copy::Copier;
use stdio::{Stream, dup_stdio, open_endpoint, stdin_pipe};

/// The endpoints opened for one process.
///
/// Every descriptor opened here is closed exactly once: by [`close`],
/// or when the set is dropped. A set that failed halfway through
/// construction never escapes, so nothing leaks on error either.
///
/// Stdin never reaches the runtime directly. Without a console it is
/// forwarded through a pipe the shim owns, so [`close_stdin`] can end it.
/// With a console attached, stdin and stdout are owned by the console's
/// copiers and the runtime itself only sees `/dev/null`.
///
/// [`close`]: IoSet::close
/// [`close_stdin`]: IoSet::close_stdin
#[derive(Debug, Default)]
pub struct IoSet {
    stdin: Option<Arc<File>>,
    stdout: Option<Arc<File>>,
    stderr: Option<File>,
    /// Read end of the stdin pipe, duplicated for the runtime.
    stdin_reader: Option<File>,
    stdin_copy: Option<Copier>,
    console: Option<Console>,
    stdin_closed: bool,
    closed: bool,
}

impl IoSet {
    /// Open the given paths. Omitted paths become `/dev/null` for the runtime.
    pub fn open(paths: &StdioPaths) -> ShimResult<Self> {
        // Endpoints opened before a failure are dropped with the partial
        // values on the early return.
        let stdin = open_endpoint(Stream::Stdin, paths.stdin.as_deref())?;
        let stdout = open_endpoint(Stream::Stdout, paths.stdout.as_deref())?;
        let stderr = open_endpoint(Stream::Stderr, paths.stderr.as_deref())?;

        Ok(Self {
            stdin: stdin.map(Arc::new),
            stdout: stdout.map(Arc::new),
            stderr,
            stdin_reader: None,
            stdin_copy: None,
            console: None,
            stdin_closed: false,
            closed: false,
        })
    }

    /// Allocate a pseudo-terminal and bridge it to the stdin/stdout endpoints.
    ///
    /// Returns the slave path to hand to the runtime.
    pub fn attach_console(&mut self) -> ShimResult<&Path> {
        if self.closed {
            return Err(ShimError::InvalidState("stdio already closed".into()));
        }
        if self.stdin_copy.is_some() {
            return Err(ShimError::InvalidState(
                "stdin already handed to the runtime".into(),
            ));
        }
        let console = Console::open(self.stdin.clone(), self.stdout.clone())?;
        Ok(self.console.insert(console).path())
    }

    pub fn console_path(&self) -> Option<&Path> {
        self.console.as_ref().map(Console::path)
    }

    /// Duplicates of the endpoints for a runtime invocation.
    ///
    /// The first call without a console starts forwarding stdin.
    pub fn runtime_stdio(&mut self) -> ShimResult<RuntimeStdio> {
        if self.console.is_some() || self.closed {
            return Ok(RuntimeStdio::null());
        }
        Ok(RuntimeStdio {
            stdin: self.runtime_stdin()?,
            stdout: dup_stdio(Stream::Stdout, self.stdout.as_deref())?,
            stderr: dup_stdio(Stream::Stderr, self.stderr.as_ref())?,
        })
    }

    fn runtime_stdin(&mut self) -> ShimResult<Stdio> {
        if self.stdin_reader.is_none() {
            let Some(stdin) = self.stdin.clone() else {
                return Ok(Stdio::null());
            };
            let (reader, writer) = stdin_pipe()?;
            self.stdin_copy = Some(Copier::spawn("stdin-copy", stdin, Arc::new(writer))?);
            self.stdin_reader = Some(reader);
        }
        dup_stdio(Stream::Stdin, self.stdin_reader.as_ref())
    }

    /// Stop forwarding stdin so the process reads end of file.
    ///
    /// Later runtime invocations get `/dev/null` as stdin. Calling it more
    /// than once is a no-op.
    pub fn close_stdin(&mut self) -> ShimResult<()> {
        if self.closed || self.stdin_closed {
            return Ok(());
        }
        self.stdin_closed = true;
        if let Some(console) = self.console.as_mut() {
            console.close_stdin()?;
        }
        // Stopping the copier closes the pipe's last writer.
        if let Some(mut copier) = self.stdin_copy.take() {
            copier.stop();
        }
        self.stdin_reader = None;
        self.stdin = None;
        tracing::trace!("Closed stdin");
        Ok(())
    }

    /// Set the console window size.
    pub fn resize(&self, width: u16, height: u16) -> ShimResult<()> {
        match &self.console {
            Some(console) => console.resize(width, height),
            None => Err(ShimError::InvalidState(
                "process has no console to resize".into(),
            )),
        }
    }

    /// Stop the copiers and close every endpoint.
    ///
    /// Calling it more than once is a no-op.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        // Copiers go first; they hold clones of stdin/stdout.
        if let Some(mut console) = self.console.take() {
            console.close();
        }
        if let Some(mut copier) = self.stdin_copy.take() {
            copier.stop();
        }
        self.stdin_reader = None;
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for IoSet {
    fn drop(&mut self) {
        self.close();
    }
}
