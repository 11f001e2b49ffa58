//! Debugging front end for the ocishim execution core.
//!
//! Every invocation opens a fresh driver on the root, so state written by an
//! earlier invocation is picked up through recovery.
//!
//! # Usage
//!
//! ```bash
//! ocishim --root /run/ocishim create c1 /srv/bundles/c1 --stdout /tmp/c1.out
//! ocishim start c1
//! ocishim exec c1 --process process.json --id debug
//! ocishim signal c1 init --signal 15
//! ocishim wait c1 init --timeout 10
//! ocishim delete c1
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use nix::sys::signal::Signal;
use serde::Serialize;

use ocishim::{
    Container, CreateOptions, ProcessOptions, RuntimeDriver, ShimOptions, StdioPaths,
    init_logging,
};

#[derive(Parser)]
#[command(name = "ocishim")]
#[command(about = "Drive the ocishim execution core from the command line")]
#[command(version)]
struct Cli {
    /// Runtime root (defaults to $OCISHIM_ROOT or /run/ocishim)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Runtime binary (defaults to $OCISHIM_RUNTIME or runc)
    #[arg(long, global = true)]
    runtime: Option<PathBuf>,

    /// JSON configuration file; flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Default)]
struct StdioArgs {
    /// Path to read stdin from
    #[arg(long)]
    stdin: Option<PathBuf>,

    /// Path to write stdout to (must exist)
    #[arg(long)]
    stdout: Option<PathBuf>,

    /// Path to write stderr to (must exist)
    #[arg(long)]
    stderr: Option<PathBuf>,

    /// Allocate a pseudo-terminal
    #[arg(long)]
    tty: bool,
}

impl StdioArgs {
    fn paths(&self) -> StdioPaths {
        StdioPaths {
            stdin: self.stdin.clone(),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a container from a bundle
    Create {
        id: String,
        bundle: PathBuf,
        #[command(flatten)]
        stdio: StdioArgs,
    },

    /// Start a created container
    Start { id: String },

    /// Print a container's state as JSON
    State { id: String },

    /// Print every container as JSON
    List,

    /// Pause a container
    Pause { id: String },

    /// Resume a paused container
    Resume { id: String },

    /// Signal a container through the runtime
    Kill {
        id: String,
        /// Signal number
        #[arg(short, long, default_value_t = 15)]
        signal: i32,
        /// Signal every process of the container
        #[arg(long)]
        all: bool,
    },

    /// Run an extra process inside a container
    Exec {
        id: String,
        /// JSON file holding an OCI process spec
        #[arg(long)]
        process: PathBuf,
        /// Process id (generated when omitted)
        #[arg(long = "id")]
        process_id: Option<String>,
        #[command(flatten)]
        stdio: StdioArgs,
    },

    /// Signal one process of a container
    Signal {
        id: String,
        process: String,
        #[arg(short, long, default_value_t = 15)]
        signal: i32,
    },

    /// Wait for one process to exit and print its exit code
    Wait {
        id: String,
        process: String,
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Forget an exec'd process
    DeleteProcess { id: String, process: String },

    /// Delete a stopped container
    Delete { id: String },
}

#[derive(Serialize)]
struct ProcessView {
    id: String,
    pid: u32,
    status: String,
    exit_code: Option<u32>,
}

#[derive(Serialize)]
struct ContainerView {
    id: String,
    bundle: PathBuf,
    status: String,
    processes: Vec<ProcessView>,
}

async fn view(driver: &RuntimeDriver, container: &Container) -> Result<ContainerView> {
    let status = driver.status(container).await?;
    Ok(ContainerView {
        id: container.id().to_string(),
        bundle: container.bundle().to_path_buf(),
        status: status.to_string(),
        processes: container
            .processes()
            .iter()
            .map(|p| ProcessView {
                id: p.id().to_string(),
                pid: p.pid(),
                status: p.status().to_string(),
                exit_code: p.exit_code(),
            })
            .collect(),
    })
}

fn parse_signal(signal: i32) -> Result<Signal> {
    Signal::try_from(signal).with_context(|| format!("invalid signal {}", signal))
}

fn load_options(cli: &Cli) -> Result<ShimOptions> {
    let mut options = match &cli.config {
        Some(path) => ShimOptions::from_file(path)?,
        None => ShimOptions::default(),
    };
    if let Some(root) = &cli.root {
        options.root = root.clone();
    }
    if let Some(runtime) = &cli.runtime {
        options.runtime.binary = runtime.clone();
    }
    if options.logging.dir.is_none() {
        options.logging.dir = Some(options.root.join(ocishim::runtime::constants::filenames::LOGS));
    }
    Ok(options)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let options = load_options(&cli)?;
    let _log_guard = init_logging(&options.logging)?;

    let driver = RuntimeDriver::open(options)
        .await
        .context("failed to open runtime driver")?;

    match cli.command {
        Commands::Create { id, bundle, stdio } => {
            let container = driver
                .create(
                    &id,
                    &bundle,
                    CreateOptions {
                        stdio: stdio.paths(),
                        terminal: stdio.tty,
                    },
                )
                .await?;
            if let Some(init) = container.init() {
                println!("{}", init.pid());
            }
        }
        Commands::Start { id } => {
            let container = driver.load(&id).await?;
            driver.start(&container).await?;
        }
        Commands::State { id } => {
            let container = driver.load(&id).await?;
            let view = view(&driver, &container).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Commands::List => {
            let mut views = Vec::new();
            for container in driver.list().await? {
                views.push(view(&driver, &container).await?);
            }
            println!("{}", serde_json::to_string_pretty(&views)?);
        }
        Commands::Pause { id } => {
            let container = driver.load(&id).await?;
            driver.pause(&container).await?;
        }
        Commands::Resume { id } => {
            let container = driver.load(&id).await?;
            driver.resume(&container).await?;
        }
        Commands::Kill { id, signal, all } => {
            let container = driver.load(&id).await?;
            driver.kill(&container, parse_signal(signal)?, all).await?;
        }
        Commands::Exec {
            id,
            process,
            process_id,
            stdio,
        } => {
            let raw = std::fs::read(&process)
                .with_context(|| format!("failed to read {}", process.display()))?;
            let spec: oci_spec::runtime::Process = serde_json::from_slice(&raw)
                .with_context(|| format!("failed to parse {}", process.display()))?;

            let container = driver.load(&id).await?;
            let mut options = ProcessOptions::new(spec);
            options.id = process_id;
            options.stdio = stdio.paths();
            options.terminal = stdio.tty;

            let record = driver.start_process(&container, options).await?;
            println!("{} {}", record.id(), record.pid());
        }
        Commands::Signal {
            id,
            process,
            signal,
        } => {
            let container = driver.load(&id).await?;
            driver.signal_process(&container, &process, parse_signal(signal)?)?;
        }
        Commands::Wait {
            id,
            process,
            timeout,
        } => {
            let container = driver.load(&id).await?;
            let wait = driver.wait_process(&container, &process);
            let code = match timeout {
                Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), wait).await {
                    Ok(code) => code?,
                    Err(_) => bail!("process {} still running after {}s", process, secs),
                },
                None => wait.await?,
            };
            println!("{}", code);
        }
        Commands::DeleteProcess { id, process } => {
            let container = driver.load(&id).await?;
            driver.delete_process(&container, &process).await?;
        }
        Commands::Delete { id } => {
            let container = driver.load(&id).await?;
            driver.delete(&container).await?;
        }
    }

    Ok(())
}
