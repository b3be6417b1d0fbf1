use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use autosync::cli::Cli;
use autosync::config::SyncConfig;
use autosync::idle::run_timer_loop;
use autosync::imap::ImapEngine;
use autosync::storage::SqliteStore;
use autosync::strategy::{FolderStrategy, MessageStrategy};
use autosync::sync::SyncManager;
use autosync::types::{FolderIdentity, FolderUri};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = SyncConfig::load()?;

    let store = Arc::new(SqliteStore::new_default().await?);
    let protocol = Arc::new(ImapEngine::new(
        cli.host.clone(),
        cli.port,
        cli.user.clone(),
        cli.password.clone(),
        store.clone(),
    ));

    let (manager, mut events) = SyncManager::new(
        config.clone(),
        protocol,
        store,
        FolderStrategy::default(),
        MessageStrategy::default(),
    );
    let manager = Arc::new(manager);

    for (idx, name) in cli.folders.iter().enumerate() {
        let mut flags = 0;
        if idx == 0 && name.eq_ignore_ascii_case("INBOX") {
            flags |= autosync::types::FolderFlags::INBOX.bits();
        }
        manager
            .register_folder(FolderIdentity {
                uri: FolderUri::from(name.as_str()),
                server_name: name.clone(),
                hierarchy_delimiter: '/',
                uid_validity: 0,
                uid_next: None,
                flags,
            })
            .await;
    }
    manager.mark_startup_done();

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(?event, "sync event");
        }
    });

    if cli.once {
        manager.timer_tick().await?;
        manager.start_idle_processing().await?;
        return Ok(());
    }

    let timer_manager = manager.clone();
    let timer_period = config.timer_interval;
    tokio::spawn(async move {
        run_timer_loop(timer_manager, timer_period).await;
    });

    manager.start_idle_processing().await?;
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    manager.pause();
    Ok(())
}

fn init_tracing() {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
