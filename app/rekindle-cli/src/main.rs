//! rekindle CLI: boot a microVM cold or from a content-addressed snapshot,
//! optionally capturing and uploading a snapshot before teardown.
//!
//! The hypervisor backend is injected behind the `Vmm` trait; this binary
//! wires the simulated backend, which is enough to exercise the whole
//! snapshot pipeline (chunking, dedup, upload, download, warm boot) against
//! a real object store.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use rekindle_core::{Config, Coordinator, NullNetwork, NullRuntime};
use rekindle_snapshot::SnapshotManager;
use rekindle_store::{DedupIndex, ObjectStore, S3Store, TtlIndex};
use rekindle_vmm::SimVmm;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "rekindle",
    version,
    about = "Boot serverless microVMs cold or from content-addressed snapshots"
)]
struct Cli {
    /// Identifier the VM is tracked under; defaults to the revision.
    #[arg(long)]
    vm_id: Option<String>,

    /// Container image name. Required unless --boot-from-snap is set.
    #[arg(long)]
    image: Option<String>,

    /// Function revision identifier.
    #[arg(long)]
    revision: String,

    /// Base path for materialized snapshots.
    #[arg(long)]
    snapshots_base_path: Option<PathBuf>,

    /// Seconds to keep the VM alive before teardown.
    #[arg(long)]
    keepalive: Option<u64>,

    /// Capture a snapshot after boot (uploading it when remote storage is
    /// enabled).
    #[arg(long)]
    make_snap: bool,

    /// Boot strictly from the snapshot for the revision; never cold-start.
    #[arg(long)]
    boot_from_snap: bool,

    /// Store snapshots in the remote object store.
    #[arg(long)]
    use_remote_storage: bool,

    /// Object store endpoint URL (e.g. http://localhost:9000).
    #[arg(long)]
    object_store_endpoint: Option<String>,

    /// Object store access key.
    #[arg(long)]
    access_key: Option<String>,

    /// Object store secret key.
    #[arg(long)]
    secret_key: Option<String>,

    /// Object store bucket.
    #[arg(long)]
    bucket: Option<String>,

    /// Configuration file (TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbose logging.
    #[arg(long)]
    debug: bool,
}

/// Exit code 1: configuration / startup failure. Exit code 2: runtime
/// failure. SIGINT tears the VM down and exits 130.
enum RunError {
    Startup(anyhow::Error),
    Runtime(anyhow::Error),
}

fn startup(err: impl Into<anyhow::Error>) -> RunError {
    RunError::Startup(err.into())
}

fn runtime(err: impl Into<anyhow::Error>) -> RunError {
    RunError::Runtime(err.into())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Startup(e)) => {
            error!("{e:#}");
            ExitCode::from(1)
        }
        Err(RunError::Runtime(e)) => {
            error!("{e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<(), RunError> {
    let config = load_config(&cli)?;

    if cli.image.is_none() && !cli.boot_from_snap {
        return Err(startup(anyhow::anyhow!(
            "--image is required unless --boot-from-snap is set"
        )));
    }
    let image = cli.image.clone().unwrap_or_default();
    let container_id = cli.vm_id.clone().unwrap_or_else(|| cli.revision.clone());

    let mut manager = SnapshotManager::new(&config.snapshots_base_path)
        .map_err(startup)?
        .with_chunk_size(config.chunk_size);
    if config.use_remote_storage {
        let store = Arc::new(S3Store::new(&config.object_store)) as Arc<dyn ObjectStore>;
        let index = Arc::new(TtlIndex::new()) as Arc<dyn DedupIndex>;
        manager = manager.with_remote(store, index);
        manager
            .ensure_remote()
            .await
            .context("preparing object store bucket")
            .map_err(startup)?;
    }

    let coordinator = Coordinator::new(
        config.coordinator_config(),
        Arc::new(manager),
        Arc::new(SimVmm::new()),
        Arc::new(NullRuntime),
        Arc::new(NullNetwork),
    );

    let cancel = CancellationToken::new();

    let vm = if cli.boot_from_snap {
        coordinator.boot_from_snapshot(&cli.revision, &cancel).await
    } else {
        coordinator.start_vm(&image, &cli.revision, &cancel).await
    }
    .context("starting VM")
    .map_err(runtime)?;

    coordinator
        .insert_active(&container_id, vm.clone())
        .context("registering container")
        .map_err(runtime)?;
    info!(
        vm_id = %vm.vm_id,
        revision = %vm.revision,
        snap_booted = vm.snap_booted,
        "VM started"
    );

    if cli.make_snap {
        coordinator
            .orch_create_snapshot(&vm, &cancel)
            .await
            .context("creating snapshot")
            .map_err(runtime)?;
        info!(revision = %vm.revision, "snapshot created");
    }

    info!(
        seconds = config.keepalive_seconds,
        "VM up, waiting for keepalive to elapse (Ctrl-C tears down)"
    );
    let interrupted = tokio::select! {
        () = tokio::time::sleep(Duration::from_secs(config.keepalive_seconds)) => false,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, tearing down");
            true
        }
    };

    let stop_result = coordinator.stop_vm(&container_id, &cancel).await;
    if interrupted {
        if let Err(e) = stop_result {
            error!("teardown after interrupt failed: {e}");
        }
        std::process::exit(130);
    }
    stop_result.context("stopping VM").map_err(runtime)?;
    info!("VM shut down");
    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config, RunError> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .map_err(startup)?;

    if let Some(path) = &cli.snapshots_base_path {
        config.snapshots_base_path = path.clone();
    }
    if let Some(keepalive) = cli.keepalive {
        config.keepalive_seconds = keepalive;
    }
    if cli.use_remote_storage {
        config.use_remote_storage = true;
    }
    if let Some(endpoint) = &cli.object_store_endpoint {
        config.object_store.endpoint = Some(endpoint.clone());
    }
    if let Some(access_key) = &cli.access_key {
        config.object_store.access_key = Some(access_key.clone());
    }
    if let Some(secret_key) = &cli.secret_key {
        config.object_store.secret_key = Some(secret_key.clone());
    }
    if let Some(bucket) = &cli.bucket {
        config.object_store.bucket = bucket.clone();
    }
    Ok(config)
}
