/*
 * SPDX-License-Identifier: Apache-2.0
 */

mod cfg;
mod run;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use cm_storage::test_util::{
    InMemoryFsPlatform, InMemoryFsWatcher, InMemoryStorage, NoopImageManager, NoopNodeInfoSource, RecordingNodeRuntime,
    RecordingSender, SequentialNetworkManager, StaticImageProvider, StaticResourceManager,
};

#[derive(Parser, Debug)]
#[command(name = "communication-manager")]
struct Cli {
    /// Path to the local TOML config file.
    #[arg(long, env = "CM_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), cm_model::CmError> {
    let cli = Cli::parse();
    let config = cfg::Config::load(cli.config.as_deref())?;
    cm_core::logging::init(&config.log_directive);

    tracing::info!(unit_id = %config.unit_id, "starting communication manager");

    // This crate has no concrete client for persistence, node dispatch, or
    // image delivery - those are external collaborators per the component
    // design. The in-memory doubles below stand in until a deployment
    // supplies its own `run::Collaborators`.
    let sender = Arc::new(RecordingSender::new());
    let collaborators = run::Collaborators {
        storage: Arc::new(InMemoryStorage::new()),
        storage_state_sender: sender.clone(),
        fs_platform: Arc::new(InMemoryFsPlatform::new()),
        fs_watcher: Arc::new(InMemoryFsWatcher::new()),
        resource_manager: Arc::new(StaticResourceManager::new()),
        node_runtime: Arc::new(RecordingNodeRuntime::new()),
        node_info_source: Arc::new(NoopNodeInfoSource::new()),
        image_provider: Arc::new(StaticImageProvider::new()),
        image_manager: Arc::new(NoopImageManager::new()),
        network_manager: Arc::new(SequentialNetworkManager::new()),
        unit_status_sender: sender,
        run_status_listener: None,
        known_nodes: Vec::new(),
    };

    let system = run::run(&config, collaborators).await?;

    tokio::signal::ctrl_c().await.map_err(|err| cm_model::CmError::failed_with("failed to listen for ctrl-c", err))?;

    tracing::info!("shutdown requested, draining subsystems");
    system.shutdown().await;
    Ok(())
}
