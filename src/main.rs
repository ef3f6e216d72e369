//! loadswarm CLI entry point

use anyhow::{Context, Result};
use loadswarm::config::cli::Cli;
use loadswarm::orchestrator::Orchestrator;
use loadswarm::remote::SshExecutor;
use loadswarm::supervise::Interrupt;
use loadswarm::Config;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    println!("loadswarm v{}", env!("CARGO_PKG_VERSION"));
    println!("Distributed load test orchestrator");
    println!();

    let cli = Cli::parse_args();
    init_logging(cli.loglevel.as_deref());
    let dry_run = cli.dry_run;

    let config = Config::from_cli(cli).context("invalid configuration")?;

    if dry_run {
        print_configuration(&config);
        println!();
        println!("Dry run mode - configuration validated successfully");
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let code = runtime.block_on(async {
        let mut interrupt = match Interrupt::install() {
            Ok(interrupt) => interrupt,
            Err(err) => {
                tracing::error!("could not install signal handlers: {err:#}");
                return 1;
            }
        };
        let exec = Arc::new(SshExecutor::new());
        let orchestrator = Orchestrator::new(Arc::new(config), exec);
        orchestrator.run(&mut interrupt).await
    });

    std::process::exit(code);
}

/// Wire -L into our own log filtering as well as the tool's; RUST_LOG
/// still wins when set.
fn init_logging(loglevel: Option<&str>) {
    let default = loglevel.unwrap_or("info").to_lowercase();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn print_configuration(config: &Config) {
    println!("Test plan:      {}", config.testplan.display());
    println!(
        "Load gens:      {} of {} ({})",
        config.node_count,
        config.nodes.len(),
        config.nodes.join(", ")
    );
    println!("Processes/node: {}", config.processes);
    println!("Total workers:  {}", config.worker_process_count());
    println!("Master port:    {}", config.port);
    match config.run_time {
        Some(t) => println!("Run time:       {}s", t.as_secs()),
        None => println!("Run time:       unlimited"),
    }
    if let Some(host) = &config.remote_master {
        println!("Remote master:  {}", host);
    }
    if !config.master_args.is_empty() {
        println!("Master args:    {}", config.master_args.join(" "));
    }
}
