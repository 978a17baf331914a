//! ptvsd - probe and attach to processes running the attach server
//!
//! # Usage
//!
//! ```text
//! ptvsd info tcp://secret@host:5678             # Print the process identity
//! ptvsd attach tcp://host -o RedirectOutput     # Attach handshake only
//! ptvsd --timeout 2 info tcp://localhost        # Give up after 2 seconds per step
//! ```
//!
//! `attach` performs the handshake and reports the result; the debug
//! protocol that would follow is not spoken by this tool.

use std::future::Future;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use ptvsd_attach::{AttachClient, AttachTarget};

// ============================================================================
// CLI Arguments
// ============================================================================

/// ptvsd - talk to an in-process debug attach server
#[derive(Parser, Debug)]
#[command(name = "ptvsd")]
#[command(about = "Probe or attach to a process with debug attach enabled")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Seconds to wait for each network step
    #[arg(long, short = 't', global = true, default_value_t = 10.0)]
    timeout: f64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the identity of the target process
    Info {
        /// Target as tcp://[secret@]host[:port]
        target: AttachTarget,
    },
    /// Perform the attach handshake
    Attach {
        /// Target as tcp://[secret@]host[:port]
        target: AttachTarget,

        /// Debug option to send, may be repeated
        #[arg(long = "option", short = 'o')]
        options: Vec<String>,
    },
}

// ============================================================================
// Main
// ============================================================================

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_tracing() {
        eprintln!("Failed to initialize logging: {e:#}");
    }

    match run(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("ptvsd=info".parse()?)
                .add_directive("ptvsd_attach=info".parse()?),
        )
        .init();
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn run(args: Args) -> Result<bool> {
    if !args.timeout.is_finite() || args.timeout <= 0.0 {
        bail!("--timeout must be a positive number of seconds");
    }
    let step = Duration::from_secs_f64(args.timeout);

    match args.command {
        Command::Info { target } => {
            let mut client = open(&target, step).await?;
            let info = within(step, "info", client.info()).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(true)
        }
        Command::Attach { target, options } => {
            let mut client = open(&target, step).await?;
            let body = within(step, "attach", client.attach(options)).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            if !body.accepted {
                eprintln!("Attach rejected: a debugger is already attached");
            }
            Ok(body.accepted)
        }
    }
}

/// Connects and authenticates.
async fn open(target: &AttachTarget, step: Duration) -> Result<AttachClient> {
    let mut client = within(step, "connect", AttachClient::connect(target)).await?;
    debug!(target = %target, "Greeting received");

    let secret = target.secret.as_deref();
    let accepted = within(step, "authenticate", client.authenticate(secret)).await?;
    if !accepted {
        bail!("Authentication rejected by {}: wrong secret or protocol version", target.address());
    }
    Ok(client)
}

async fn within<T, E>(
    step: Duration,
    what: &str,
    future: impl Future<Output = std::result::Result<T, E>>,
) -> Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    tokio::time::timeout(step, future)
        .await
        .with_context(|| format!("Timed out waiting for {what}"))?
        .with_context(|| format!("{what} failed"))
}
