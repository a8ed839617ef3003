use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast;
use tracing::{info, warn};
use url::Url;

use davbox_core::{AccountSpec, Credentials, SessionManager};

use crate::ops::executor::OperationExecutor;
use crate::ops::sync_lane::SyncFolderLane;
use crate::storage::{FileStore, MemoryStore};
use crate::sync::adapter::{AccountSyncPass, LogNotifier, RemoteFolderSyncer};
use crate::sync::events::SyncEvent;

const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;
const DEFAULT_STORAGE_ROOT: &str = "/var/lib/davbox";
const DEFAULT_USER_AGENT: &str = concat!("davbox/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub server_url: Url,
    pub account: String,
    pub credentials: Credentials,
    pub sync_interval: Duration,
    pub storage_root: String,
    pub user_agent: String,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let server_url = std::env::var("DAVBOX_SERVER_URL")
            .context("DAVBOX_SERVER_URL is not set")?
            .parse()
            .context("DAVBOX_SERVER_URL is not a valid url")?;
        let account = std::env::var("DAVBOX_ACCOUNT").context("DAVBOX_ACCOUNT is not set")?;
        let credentials = match std::env::var("DAVBOX_TOKEN") {
            Ok(token) => Credentials::bearer(token),
            Err(_) => {
                let user = std::env::var("DAVBOX_USER").unwrap_or_else(|_| account.clone());
                let password =
                    std::env::var("DAVBOX_PASSWORD").context("neither DAVBOX_TOKEN nor DAVBOX_PASSWORD is set")?;
                Credentials::basic(user, password)
            }
        };
        Ok(Self {
            server_url,
            account,
            credentials,
            sync_interval: Duration::from_secs(parse_u64(
                std::env::var("DAVBOX_SYNC_INTERVAL_SECS").ok(),
                DEFAULT_SYNC_INTERVAL_SECS,
            )),
            storage_root: std::env::var("DAVBOX_STORAGE_ROOT")
                .unwrap_or_else(|_| DEFAULT_STORAGE_ROOT.to_string()),
            user_agent: std::env::var("DAVBOX_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
        })
    }

    pub fn account_spec(&self) -> AccountSpec {
        AccountSpec {
            name: Some(self.account.clone()),
            base_url: self.server_url.clone(),
            credentials: self.credentials.clone(),
        }
    }
}

fn parse_u64(value: Option<String>, default: u64) -> u64 {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(default)
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    sessions: Arc<SessionManager>,
    store: Arc<dyn FileStore>,
    executor: OperationExecutor,
    sync_lane: SyncFolderLane,
    events: broadcast::Sender<SyncEvent>,
}

impl DaemonRuntime {
    pub fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let sessions = Arc::new(SessionManager::new(config.user_agent.clone()));
        let store: Arc<dyn FileStore> = Arc::new(MemoryStore::new(config.storage_root.clone()));
        let (events, _) = broadcast::channel(256);
        let executor = OperationExecutor::new(sessions.clone());
        let sync_lane = SyncFolderLane::new(sessions.clone(), store.clone(), events.clone());
        Ok(Self {
            config,
            sessions,
            store,
            executor,
            sync_lane,
            events,
        })
    }

    pub fn executor(&self) -> &OperationExecutor {
        &self.executor
    }

    pub fn sync_lane(&self) -> &SyncFolderLane {
        &self.sync_lane
    }

    pub fn events(&self) -> broadcast::Sender<SyncEvent> {
        self.events.clone()
    }

    /// Runs one full-account pass.
    pub async fn sync_account_once(&self, manual: bool) -> anyhow::Result<()> {
        let syncer = RemoteFolderSyncer::new(
            self.sessions.clone(),
            self.config.account_spec(),
            self.store.clone(),
        );
        let pass = AccountSyncPass::new(self.config.account.clone(), self.events.clone());
        let outcome = pass.run(&syncer, &LogNotifier, "/", manual).await;
        info!(
            account = %self.config.account,
            failed_folders = outcome.stats.failed_folders,
            conflicts = outcome.stats.conflicts,
            "account pass finished"
        );
        Ok(())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let event_task = tokio::spawn(log_events(self.events.subscribe()));
        let sync_task = {
            let syncer = RemoteFolderSyncer::new(
                self.sessions.clone(),
                self.config.account_spec(),
                self.store.clone(),
            );
            let account = self.config.account.clone();
            let events = self.events.clone();
            let interval = self.config.sync_interval;
            tokio::spawn(async move {
                loop {
                    let pass = AccountSyncPass::new(account.clone(), events.clone());
                    let outcome = pass.run(&syncer, &LogNotifier, "/", false).await;
                    if outcome.needs_credentials_refresh {
                        warn!(%account, "credentials need a refresh, pausing periodic sync");
                        break;
                    }
                    tokio::time::sleep(interval).await;
                }
            })
        };

        info!("daemon running");
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
        info!("shutting down");
        sync_task.abort();
        event_task.abort();
        self.sync_lane.shutdown();
        self.executor.shutdown();
        Ok(())
    }
}

async fn log_events(mut rx: broadcast::Receiver<SyncEvent>) {
    while let Ok(event) = rx.recv().await {
        match event {
            SyncEvent::Started { account } => info!(%account, "sync started"),
            SyncEvent::Finished { account, success } => {
                info!(%account, success, "sync finished")
            }
            SyncEvent::FolderQueued { account, path } => {
                info!(%account, %path, "folder queued")
            }
            SyncEvent::FolderContentsSynced {
                account,
                path,
                code,
            } => info!(%account, %path, ?code, "folder synced"),
        }
    }
}
