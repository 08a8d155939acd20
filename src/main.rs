use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tidepool::adapter::{DockerAdapter, SandboxConfig, Throttled};
use tidepool::config::Config;
use tidepool::pool::{Pool, PoolConfig};
use tidepool::runner::{EndSessionOpts, RunOpts, Runner, RunnerConfig};
use tidepool::store::MemoryStore;
use tidepool::telemetry::Telemetry;

#[derive(Parser)]
#[command(name = "tidepool")]
#[command(
    author,
    version,
    about = "Warm sandbox pools and session-bound command execution"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory containing tidepool.toml
    #[arg(short, long, global = true, default_value = ".")]
    config_dir: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Keep warm sandbox pools stocked until interrupted
    Serve,

    /// Execute one command in a sandbox
    Run {
        /// Bind the command to a durable session
        #[arg(short, long)]
        session: Option<String>,

        /// Region for session keying
        #[arg(short, long)]
        region: Option<String>,

        /// Terminate the session's sandbox after the command completes
        #[arg(long, requires = "session")]
        end_session: bool,

        /// Command line to execute inside the sandbox
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("tidepool=debug")
    } else {
        EnvFilter::new("tidepool=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = Config::load(&cli.config_dir)?;

    match cli.command {
        Commands::Serve => serve(config).await?,
        Commands::Run {
            session,
            region,
            end_session,
            command,
        } => run(config, session, region, end_session, command).await?,
    }

    Ok(())
}

fn sandbox_config(config: &Config) -> SandboxConfig {
    SandboxConfig {
        image: config.sandbox.image.clone(),
        env: config.sandbox.env.clone(),
        memory: config.sandbox.memory.clone(),
        cpus: config.sandbox.cpus.clone(),
        volumes: Vec::new(),
    }
}

async fn connect_adapter() -> Result<Arc<Throttled>> {
    let docker = DockerAdapter::connect()
        .await
        .context("Failed to connect to the Docker daemon")?;
    Ok(Arc::new(Throttled::shared(Arc::new(docker))))
}

async fn serve(config: Config) -> Result<()> {
    let adapter = connect_adapter().await?;
    let telemetry = Telemetry::new(&config.telemetry);
    let sandbox = sandbox_config(&config);

    let pool = Pool::start(
        adapter,
        Arc::new(MemoryStore::new()),
        PoolConfig {
            partitions: config.pool.partitions.clone(),
            target_per_partition: config.pool.target_per_partition,
            max_age: Duration::from_millis(config.pool.max_age_ms),
            replenish_interval: Duration::from_millis(config.pool.replenish_interval_ms),
            health_timeout: Duration::from_millis(config.health.timeout_ms),
            health_interval: Duration::from_millis(config.health.interval_ms),
            config_builder: Arc::new(move |_partition| sandbox.clone()),
        },
        telemetry,
    );

    println!(
        "{} {}",
        "Warm pool running for partitions:".green().bold(),
        config.pool.partitions.join(", ")
    );
    println!("Press Ctrl-C to stop.\n");

    let mut ticker =
        tokio::time::interval(Duration::from_millis(config.pool.replenish_interval_ms));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let status = pool.status().await?;
                let mut partitions: Vec<_> = status.per_partition.iter().collect();
                partitions.sort();
                for (partition, count) in partitions {
                    println!(
                        "  {} {} warm, {} creations pending",
                        partition.cyan(),
                        count,
                        status.pending_creations
                    );
                }
            }
        }
    }

    // Warm sandboxes are left behind for external reconciliation.
    println!("\n{}", "Stopped. Warm sandboxes were not terminated.".yellow());
    Ok(())
}

async fn run(
    config: Config,
    session: Option<String>,
    region: Option<String>,
    end_session: bool,
    command: Vec<String>,
) -> Result<()> {
    if command.is_empty() {
        anyhow::bail!("No command given");
    }
    let command_line = shell_words::join(&command);

    let adapter = connect_adapter().await?;
    let telemetry = Telemetry::new(&config.telemetry);
    let runner = Runner::start(
        adapter,
        RunnerConfig::from_settings(sandbox_config(&config), &config.runner, &config.health),
        telemetry,
    );

    let opts = RunOpts {
        session: session.clone(),
        region: region.clone(),
        ..RunOpts::default()
    };
    let output = runner.run(&command_line, opts).await?;

    if !output.stdout.is_empty() {
        print!("{}", output.stdout);
    }
    if !output.stderr.is_empty() {
        eprint!("{}", output.stderr.red());
    }

    if end_session {
        if let Some(session_id) = &session {
            runner
                .end_session(
                    session_id,
                    EndSessionOpts {
                        region,
                        delete_volume: true,
                    },
                )
                .await?;
        }
    }

    if !output.success() {
        anyhow::bail!("Command exited with status {}", output.exit_code);
    }
    Ok(())
}
