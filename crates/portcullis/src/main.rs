mod cli;
mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use flow_audit::{FlowLedger, JournalSink};
use rule_engine::RuleEngine;
use tcp_relay::{Relay, RelayConfig};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args.
    let cli = Cli::parse();

    // 2. Load config, then merge CLI overrides.
    let mut cfg = config::load(&cli.config)?;

    if let Some(ref listen) = cli.listen {
        cfg.network.listen_addr = listen.clone();
    }
    if let Some(ref target) = cli.target {
        cfg.network.target_addr = target.clone();
    }
    if let Some(ref rules) = cli.rules {
        cfg.rules.root = rules.clone();
    }
    if let Some(ref journal) = cli.journal {
        cfg.logging.journal_path = journal.clone();
    }

    // 3. Init tracing-subscriber with JSON format.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();

    info!(
        config_file = %cli.config.display(),
        listen = %cfg.network.listen_addr,
        target = %cfg.network.target_addr,
        rules = %cfg.rules.root.display(),
        "portcullis starting"
    );

    // 4. Start the audit journal and the session ledger.
    let (journal, _journal_handle) = JournalSink::start(&cfg.logging.journal_path)
        .await
        .context("failed to start audit journal")?;
    let ledger = FlowLedger::with_journal(
        Duration::from_secs(cfg.session.timeout_secs),
        journal,
    );

    // 5. Load the rule engine. The same handle serves the relay and any
    //    management surface.
    let engine = Arc::new(RuleEngine::new(&cfg.rules.root));
    let active = engine
        .reload()
        .context("failed to load the rule directory")?;
    info!(active, root = %cfg.rules.root.display(), "rule engine loaded");

    // 6. Resolve endpoints.
    let listen_addr = cfg
        .network
        .listen_addr
        .parse()
        .context("invalid listen address")?;
    let target_addr = cfg
        .network
        .target_addr
        .parse()
        .context("invalid target address")?;

    // 7. Run the relay until a shutdown signal arrives.
    let relay = Relay::new(RelayConfig {
        listen_addr,
        target_addr,
        engine,
        ledger,
    });

    tokio::select! {
        result = relay.run() => result.context("relay terminated")?,
        _ = shutdown_signal() => {}
    }

    info!("portcullis stopped");
    Ok(())
}

/// Completes when SIGINT (ctrl-c) or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                info!("received SIGINT (ctrl-c)");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT (ctrl-c)");
    }
}
