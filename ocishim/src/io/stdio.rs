//! Opening stdio endpoints and handing them to the runtime subprocess.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::process::Stdio;

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::unistd::pipe2;
use ocishim_shared::errors::{ShimError, ShimResult};

/// Which stream an endpoint serves; decides the open mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stream {
    Stdin,
    Stdout,
    Stderr,
}

impl Stream {
    fn name(&self) -> &'static str {
        match self {
            Stream::Stdin => "stdin",
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

/// Open one endpoint: stdin read-only, stdout/stderr write-only.
///
/// The path must already exist (a file or a fifo). Opening a fifo blocks
/// until its other end is opened.
pub(crate) fn open_endpoint(stream: Stream, path: Option<&Path>) -> ShimResult<Option<File>> {
    let Some(path) = path else {
        return Ok(None);
    };

    let mut options = OpenOptions::new();
    match stream {
        Stream::Stdin => options.read(true),
        Stream::Stdout | Stream::Stderr => options.write(true),
    };
    options.custom_flags(libc::O_CLOEXEC);

    let file = options.open(path).map_err(|e| {
        ShimError::Io(format!(
            "failed to open {} {}: {}",
            stream.name(),
            path.display(),
            e
        ))
    })?;
    Ok(Some(file))
}

/// Stdio for one runtime invocation.
///
/// Each value is a duplicate of an endpoint; the duplicates are closed once
/// the subprocess has been spawned and the `Command` dropped.
#[derive(Debug)]
pub struct RuntimeStdio {
    pub stdin: Stdio,
    pub stdout: Stdio,
    pub stderr: Stdio,
}

impl RuntimeStdio {
    /// `/dev/null` on all three streams.
    pub fn null() -> Self {
        Self {
            stdin: Stdio::null(),
            stdout: Stdio::null(),
            stderr: Stdio::null(),
        }
    }
}

impl Default for RuntimeStdio {
    fn default() -> Self {
        Self::null()
    }
}

pub(crate) fn dup_stdio(stream: Stream, file: Option<&File>) -> ShimResult<Stdio> {
    match file {
        Some(file) => {
            let dup = file.try_clone().map_err(|e| {
                ShimError::Io(format!("failed to duplicate {}: {}", stream.name(), e))
            })?;
            Ok(Stdio::from(dup))
        }
        None => Ok(Stdio::null()),
    }
}

/// Pipe carrying stdin to the process: `(reader, writer)`.
///
/// Only the shim's writer is non-blocking; the reader goes to the process
/// as is.
pub(crate) fn stdin_pipe() -> ShimResult<(File, File)> {
    let (reader, writer) = pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| ShimError::Io(format!("failed to create stdin pipe: {}", e)))?;
    fcntl(&writer, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
        .map_err(|e| ShimError::Io(format!("failed to set stdin pipe non-blocking: {}", e)))?;
    Ok((File::from(reader), File::from(writer)))
}
