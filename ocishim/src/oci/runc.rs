//! [`OciRuntime`] backed by a runc-compatible binary.

use std::ffi::{OsStr, OsString};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use nix::sys::signal::Signal;
use ocishim_shared::errors::{ShimError, ShimResult};
use tokio::process::Command;

use super::{CreateRequest, ExecRequest, OciRuntime, RuntimeState};
use crate::io::RuntimeStdio;
use crate::runtime::options::{RuntimeLogFormat, RuntimeOptions};

/// Invokes the runtime binary once per operation.
///
/// Every invocation is a `tokio::process::Command` with `kill_on_drop`, so
/// dropping an operation's future also kills the subprocess.
#[derive(Debug, Clone)]
pub struct RuncClient {
    binary: PathBuf,
    root: PathBuf,
    extra_args: Vec<String>,
    debug: bool,
    log: Option<PathBuf>,
    log_format: Option<RuntimeLogFormat>,
}

impl RuncClient {
    /// Client for `options.binary` keeping its state under `root`.
    pub fn new(options: &RuntimeOptions, root: PathBuf) -> Self {
        Self {
            binary: options.binary.clone(),
            root,
            extra_args: options.args.clone(),
            debug: options.debug,
            log: options.log.clone(),
            log_format: options.log_format,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Full argument vector: global flags, extra args, then the verb.
    fn args<I, S>(&self, verb: &str, verb_args: I) -> Vec<OsString>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut args: Vec<OsString> = vec!["--root".into(), self.root.clone().into()];
        if self.debug {
            args.push("--debug".into());
        }
        if let Some(log) = &self.log {
            args.push("--log".into());
            args.push(log.clone().into());
        }
        if let Some(format) = self.log_format {
            args.push("--log-format".into());
            args.push(format.as_str().into());
        }
        args.extend(self.extra_args.iter().map(OsString::from));
        args.push(verb.into());
        args.extend(verb_args.into_iter().map(|a| a.as_ref().to_os_string()));
        args
    }

    fn command(&self, args: Vec<OsString>) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).kill_on_drop(true);
        cmd
    }

    fn binary_name(&self) -> String {
        self.binary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.binary.display().to_string())
    }

    /// Run a verb with captured output and return stdout.
    async fn run(&self, verb: &str, args: Vec<OsString>) -> ShimResult<Vec<u8>> {
        let mut cmd = self.command(self.args(verb, args));
        cmd.stdin(Stdio::null());

        tracing::trace!(binary = %self.binary.display(), verb = verb, "Invoking runtime");
        let output = cmd.output().await.map_err(|e| self.spawn_error(verb, e))?;
        if output.status.success() {
            return Ok(output.stdout);
        }

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        Err(self.failure(verb, &String::from_utf8_lossy(&combined)))
    }

    /// Run a verb whose child process inherits the given stdio.
    ///
    /// Output cannot be captured here: the container keeps these
    /// descriptors open after the runtime exits.
    async fn run_with_stdio(
        &self,
        verb: &str,
        args: Vec<OsString>,
        stdio: RuntimeStdio,
    ) -> ShimResult<()> {
        let mut cmd = self.command(self.args(verb, args));
        cmd.stdin(stdio.stdin)
            .stdout(stdio.stdout)
            .stderr(stdio.stderr);

        tracing::trace!(binary = %self.binary.display(), verb = verb, "Invoking runtime");
        let status = cmd.status().await.map_err(|e| self.spawn_error(verb, e))?;
        // `cmd` holds the stdio duplicates until it is dropped.
        drop(cmd);
        if status.success() {
            return Ok(());
        }
        Err(self.failure(verb, &self.status_message(status)))
    }

    fn status_message(&self, status: ExitStatus) -> String {
        match &self.log {
            Some(log) => format!("{} (see {})", status, log.display()),
            None => status.to_string(),
        }
    }

    fn spawn_error(&self, verb: &str, e: std::io::Error) -> ShimError {
        ShimError::Runtime(format!(
            "failed to run '{} {}' ({}): {}",
            self.binary_name(),
            verb,
            self.binary.display(),
            e
        ))
    }

    fn failure(&self, verb: &str, output: &str) -> ShimError {
        runtime_failure(&self.binary_name(), verb, output)
    }
}

fn runtime_failure(binary: &str, verb: &str, output: &str) -> ShimError {
    let output = output.trim();
    if output.contains("does not exist") || output.contains("container not found") {
        return ShimError::NotFound(format!("'{} {}': {}", binary, verb, output));
    }
    ShimError::Runtime(format!(
        "'{} {}' failed with output: {}",
        binary, verb, output
    ))
}

fn parse_list(stdout: &[u8]) -> ShimResult<Vec<RuntimeState>> {
    // runc prints `null` when it knows no containers.
    let states: Option<Vec<RuntimeState>> = serde_json::from_slice(stdout)
        .map_err(|e| ShimError::Runtime(format!("failed to parse list output: {}", e)))?;
    Ok(states.unwrap_or_default())
}

#[async_trait::async_trait]
impl OciRuntime for RuncClient {
    async fn create(&self, request: CreateRequest<'_>) -> ShimResult<()> {
        let mut args: Vec<OsString> = vec![
            "--bundle".into(),
            request.bundle.into(),
            "--pid-file".into(),
            request.pid_file.into(),
        ];
        if let Some(console) = request.console {
            args.push("--console".into());
            args.push(console.into());
        }
        args.push(request.id.into());

        self.run_with_stdio("create", args, request.stdio).await
    }

    async fn start(&self, id: &str) -> ShimResult<()> {
        self.run("start", vec![id.into()]).await.map(|_| ())
    }

    async fn state(&self, id: &str) -> ShimResult<RuntimeState> {
        let stdout = self.run("state", vec![id.into()]).await?;
        serde_json::from_slice(&stdout)
            .map_err(|e| ShimError::Runtime(format!("failed to parse state of {}: {}", id, e)))
    }

    async fn pause(&self, id: &str) -> ShimResult<()> {
        self.run("pause", vec![id.into()]).await.map(|_| ())
    }

    async fn resume(&self, id: &str) -> ShimResult<()> {
        self.run("resume", vec![id.into()]).await.map(|_| ())
    }

    async fn delete(&self, id: &str) -> ShimResult<()> {
        self.run("delete", vec![id.into()]).await.map(|_| ())
    }

    async fn kill(&self, id: &str, signal: Signal, all: bool) -> ShimResult<()> {
        let mut args: Vec<OsString> = Vec::new();
        if all {
            args.push("--all".into());
        }
        args.push(id.into());
        args.push((signal as i32).to_string().into());
        self.run("kill", args).await.map(|_| ())
    }

    async fn exec(&self, request: ExecRequest<'_>) -> ShimResult<()> {
        let mut spec_file = tempfile::Builder::new()
            .prefix("process-")
            .suffix(".json")
            .tempfile()
            .map_err(|e| ShimError::Runtime(format!("failed to create process spec file: {}", e)))?;
        serde_json::to_writer(&mut spec_file, request.process)
            .map_err(|e| ShimError::Runtime(format!("failed to write process spec: {}", e)))?;
        spec_file
            .flush()
            .map_err(|e| ShimError::Runtime(format!("failed to write process spec: {}", e)))?;

        let mut args: Vec<OsString> = vec!["--process".into(), spec_file.path().into()];
        if let Some(console) = request.console {
            args.push("--tty".into());
            args.push("--console".into());
            args.push(console.into());
        }
        if let Some(cwd) = request.cwd {
            args.push("--cwd".into());
            args.push(cwd.into());
        }
        if request.detach {
            args.push("--detach".into());
        }
        args.push("--pid-file".into());
        args.push(request.pid_file.into());
        args.push(request.id.into());

        // The spec file must outlive the invocation.
        let result = self.run_with_stdio("exec", args, request.stdio).await;
        drop(spec_file);
        result
    }

    async fn list(&self) -> ShimResult<Vec<RuntimeState>> {
        let stdout = self
            .run("list", vec!["--format".into(), "json".into()])
            .await?;
        parse_list(&stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(options: RuntimeOptions) -> RuncClient {
        RuncClient::new(&options, PathBuf::from("/run/shim/runc"))
    }

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_global_args_precede_verb() {
        let options = RuntimeOptions {
            binary: PathBuf::from("/usr/bin/runc"),
            root: None,
            args: vec!["--systemd-cgroup".into()],
            debug: true,
            log: Some(PathBuf::from("/var/log/runc.log")),
            log_format: Some(RuntimeLogFormat::Json),
        };
        let args = strings(client(options).args("kill", ["--all", "c1", "9"]));
        assert_eq!(
            args,
            vec![
                "--root",
                "/run/shim/runc",
                "--debug",
                "--log",
                "/var/log/runc.log",
                "--log-format",
                "json",
                "--systemd-cgroup",
                "kill",
                "--all",
                "c1",
                "9"
            ]
        );
    }

    #[test]
    fn test_minimal_args() {
        let options = RuntimeOptions {
            binary: PathBuf::from("runc"),
            ..RuntimeOptions::default()
        };
        let args = strings(client(options).args("state", ["c1"]));
        assert_eq!(args, vec!["--root", "/run/shim/runc", "state", "c1"]);
    }

    #[test]
    fn test_failure_mapping() {
        let err = runtime_failure("runc", "state", "container \"c9\" does not exist\n");
        assert!(err.is_not_found());

        let err = runtime_failure("runc", "start", "cannot start a container that has stopped");
        assert_eq!(
            err.to_string(),
            "runtime error: 'runc start' failed with output: cannot start a container that has stopped"
        );
    }

    #[test]
    fn test_parse_list() {
        assert!(parse_list(b"null").unwrap().is_empty());
        let states = parse_list(
            br#"[{"id":"a","pid":1,"status":"running","bundle":"/b/a","created":"2024-01-01T00:00:00Z"}]"#,
        )
        .unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].id, "a");
        assert!(parse_list(b"garbage").is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_is_runtime_error() {
        let options = RuntimeOptions {
            binary: PathBuf::from("/nonexistent/runc"),
            ..RuntimeOptions::default()
        };
        let err = client(options).list().await.unwrap_err();
        assert!(matches!(err, ShimError::Runtime(_)));
    }
}
