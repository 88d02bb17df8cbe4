// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Phase worker entry point
//!
//! One invocation runs one phase once and exits, which is how the engine
//! is deployed: six cron entries, one per phase. Per-migration failures
//! are recorded in the store and reported in the run counters; only
//! configuration and store failures exit nonzero, since those mean the
//! invocation could not do its job at all.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use archiver::backend::BackendRegistry;
use archiver::config::{EngineConfig, RegistryFile};
use archiver::lock::LockCoordinator;
use archiver::pack::Staging;
use archiver::store::{MigrationStore, PostgresStore};
use archiver::workers::{
    self, AdmitWorker, MonitorWorker, PackWorker, PhaseWorker, TidyWorker, TransferWorker,
    VerifyWorker,
};

#[derive(Parser)]
#[command(name = "archiver", about = "Batch migration phase workers", version)]
struct Cli {
    #[command(subcommand)]
    phase: PhaseCommand,
}

#[derive(Subcommand)]
enum PhaseCommand {
    /// Admit waiting migrations into their pipelines
    Lock,
    /// Build archives for PUT, extract and restore them for GET
    Pack,
    /// Issue backend put/get/delete jobs
    Transfer,
    /// Poll backend jobs and advance completed transfers
    Monitor,
    /// Check re-downloaded archives against pack-time digests
    Verify,
    /// Clean staging and finish completed migrations
    Tidy,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env()?;
    info!(
        database = %config.database_url_display(),
        staging = %config.staging_dir.display(),
        "starting phase worker"
    );

    let registry_file = RegistryFile::load(&config.backends_file)?;
    let registry = Arc::new(BackendRegistry::from_file(
        &registry_file,
        std::time::Duration::from_secs(config.http_timeout_secs),
    )?);
    info!(backends = ?registry.names(), "backend registry loaded");

    let store: Arc<dyn MigrationStore> = Arc::new(
        PostgresStore::new(&config.database_url)
            .await
            .context("connecting to migration store")?,
    );
    let locks = LockCoordinator::new(store.clone(), config.lock_lease_secs);
    let staging = Staging::new(&config.staging_dir);

    let worker: Box<dyn PhaseWorker> = match cli.phase {
        PhaseCommand::Lock => Box::new(AdmitWorker::new(store.clone(), registry)),
        PhaseCommand::Pack => {
            Box::new(PackWorker::new(store.clone(), registry, staging))
        }
        PhaseCommand::Transfer => {
            Box::new(TransferWorker::new(store.clone(), registry, staging))
        }
        PhaseCommand::Monitor => Box::new(MonitorWorker::new(
            store.clone(),
            registry,
            config.max_poll_secs,
        )),
        PhaseCommand::Verify => Box::new(VerifyWorker::new(
            store.clone(),
            staging,
            config.max_verify_attempts,
        )),
        PhaseCommand::Tidy => Box::new(TidyWorker::new(store.clone(), registry, staging)),
    };

    let report = workers::run_phase(store, &locks, worker.as_ref(), config.max_retries)
        .await
        .context("phase invocation aborted")?;

    info!(?report, "done");
    Ok(())
}
