use clap::Parser;
use cmd_runner::config::{self, DEFAULT_CONFIG_FILE};
use cmd_runner::{RunStatus, Supervisor};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Run a script under a deadline, mirroring its output live while
/// capturing it, and kill its whole process group if it overruns.
#[derive(Parser, Debug)]
#[command(name = "cmd-runner", version, about)]
pub struct Cli {
    /// Path to the executable script
    #[arg(value_name = "SCRIPT")]
    script: String,

    /// Timeout in seconds, 0 or less means the 3s default (overrides config)
    #[arg(short, long, allow_negative_numbers = true)]
    timeout: Option<i64>,

    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Print a JSON summary of the outcome when done
    #[arg(long)]
    json: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (spawn, kill and drain details)
    #[arg(short, long)]
    verbose: bool,

    /// Suppress start/finish banners, only errors
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    };
    if let Some(timeout) = cli.timeout {
        config.supervisor.timeout_secs = timeout;
    }

    let supervisor = Supervisor::from_config(&config.supervisor);
    let timeout_secs = supervisor.timeout().as_secs();

    if cli.dry_run {
        println!("cmd-runner v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file: {}", cli.config.display());
        println!("Script: {}", cli.script.trim());
        println!("Timeout: {timeout_secs}s");
        println!("Kill grace: {}ms", config.supervisor.kill_grace_ms);
        println!("Escalate to SIGKILL: {}", config.supervisor.escalate);
        return;
    }

    if !cli.quiet {
        println!(
            "\nStarting the execution of the script: \n{} with timeout: {}s",
            cli.script.trim(),
            timeout_secs
        );
    }

    let outcome = supervisor.run(&cli.script).await;

    match &outcome.status {
        RunStatus::Success => {
            if !cli.quiet {
                println!("Execution of the script finished successfully");
            }
        }
        RunStatus::TimedOut { .. } => {
            if !cli.quiet {
                println!("Process killed as timeout({timeout_secs}) reached");
            }
        }
        RunStatus::ExecutionError { code, signal } => match (code, signal) {
            (Some(code), _) => eprintln!("Error: process finished with exit code {code}"),
            (None, Some(signal)) => eprintln!("Error: process terminated by signal {signal}"),
            (None, None) => eprintln!("Error: process finished with an unknown status"),
        },
        RunStatus::Failed(e) => eprintln!("Error: {e}"),
    }

    if cli.json {
        match serde_json::to_string_pretty(&outcome.summary()) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("Error: failed to serialize outcome: {e}"),
        }
    }

    std::process::exit(outcome.exit_code());
}
