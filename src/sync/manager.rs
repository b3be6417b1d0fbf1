//! `SyncManager`: the three global queues, idle/pause state, and the
//! periodic timer.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{info, warn};

use crate::config::{DownloadModel, SyncConfig};
use crate::errors::{SyncError, SyncResult};
use crate::protocol::{ExitCode, ProtocolEngine, SelectOutcome, UrlOutcome};
use crate::store::MessageStore;
use crate::strategy::{FolderStrategy, MessageStrategy, Priority};
use crate::types::{FolderFlags, FolderIdentity, FolderUri, ServerCounts};

use super::folder_state::{FolderSyncState, SyncState};
use super::queues::{DedupQueue, PriorityQueue, QueueKind};

/// Composite idle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdleState {
    NotIdle,
    SystemIdle,
    AppIdle,
}

/// Listener events. Delivered over a `tokio::sync::broadcast` channel
/// rather than a registered-observer list — there is no process-wide
/// singleton, and subscribing is just cloning the receiver.
#[derive(Clone, Debug)]
pub enum SyncEvent {
    FolderAddedIntoQ(QueueKind, FolderUri),
    FolderRemovedFromQ(QueueKind, FolderUri),
    DiscoveryQProcessed {
        folder: FolderUri,
        processed: usize,
        left_to_process: usize,
    },
    DownloadStarted {
        folder: FolderUri,
        msgs_in_batch: usize,
        total_in_folder: usize,
    },
    DownloadCompleted(FolderUri),
    DownloadError(FolderUri),
    StateChanged(bool),
    AutoSyncInitiated(FolderUri),
}

/// Owns the three global queues, the folder arena, idle/pause state, and
/// dispatches to `FolderSyncState` objects. Holds its collaborators as
/// `Arc<dyn ...>`: dependencies are passed in, nothing touches process-scope
/// state.
pub struct SyncManager {
    folders: RwLock<HashMap<FolderUri, FolderSyncState>>,
    identities: RwLock<HashMap<FolderUri, FolderIdentity>>,
    open_folders: Mutex<HashSet<FolderUri>>,

    priority_queue: Mutex<PriorityQueue>,
    discovery_queue: Mutex<DedupQueue>,
    update_queue: Mutex<DedupQueue>,

    /// One lock per folder, acquired for the whole fetch-and-persist
    /// operation in `pump_folder`. Prevents two callers (the timer task and
    /// an idle-transition caller, say) from issuing overlapping FETCHes
    /// against the same folder's offline store.
    download_locks: Mutex<HashMap<FolderUri, Arc<Mutex<()>>>>,

    idle_state: Mutex<IdleState>,
    paused: AtomicBool,
    update_in_progress: AtomicBool,
    startup_done: AtomicBool,

    config: SyncConfig,
    folder_strategy: FolderStrategy,
    message_strategy: MessageStrategy,

    protocol: Arc<dyn ProtocolEngine>,
    store: Arc<dyn MessageStore>,

    events: broadcast::Sender<SyncEvent>,
}

impl SyncManager {
    pub fn new(
        config: SyncConfig,
        protocol: Arc<dyn ProtocolEngine>,
        store: Arc<dyn MessageStore>,
        folder_strategy: FolderStrategy,
        message_strategy: MessageStrategy,
    ) -> (Self, broadcast::Receiver<SyncEvent>) {
        let (tx, rx) = broadcast::channel(256);
        let manager = SyncManager {
            folders: RwLock::new(HashMap::new()),
            identities: RwLock::new(HashMap::new()),
            open_folders: Mutex::new(HashSet::new()),
            priority_queue: Mutex::new(PriorityQueue::new()),
            discovery_queue: Mutex::new(DedupQueue::new()),
            update_queue: Mutex::new(DedupQueue::new()),
            download_locks: Mutex::new(HashMap::new()),
            idle_state: Mutex::new(IdleState::NotIdle),
            paused: AtomicBool::new(false),
            update_in_progress: AtomicBool::new(false),
            startup_done: AtomicBool::new(false),
            config,
            folder_strategy,
            message_strategy,
            protocol,
            store,
            events: tx,
        };
        (manager, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn mark_startup_done(&self) {
        self.startup_done.store(true, Ordering::SeqCst);
    }

    /// Lazily creates a `FolderSyncState` for `identity.uri` and records its
    /// identity.
    pub async fn register_folder(&self, identity: FolderIdentity) {
        let uri = identity.uri.clone();
        self.identities.write().await.insert(uri.clone(), identity);
        self.folders
            .write()
            .await
            .entry(uri.clone())
            .or_insert_with(|| FolderSyncState::new(uri));
    }

    pub async fn set_folder_open(&self, folder: &FolderUri, open: bool) {
        let mut set = self.open_folders.lock().await;
        if open {
            set.insert(folder.clone());
        } else {
            set.remove(folder);
        }
    }

    async fn identity(&self, folder: &FolderUri) -> SyncResult<FolderIdentity> {
        self.identities
            .read()
            .await
            .get(folder)
            .cloned()
            .ok_or_else(|| SyncError::Fatal(format!("unknown folder {folder}")))
    }

    // ---- public operations ----------------------

    pub async fn notify_folder_has_pending_messages(&self, folder: &FolderUri) -> SyncResult<()> {
        let identity = self.identity(folder).await?;
        if identity.folder_flags().contains(FolderFlags::TRASH) {
            return Ok(());
        }
        let head_insert =
            identity.folder_flags().contains(FolderFlags::SENT) || identity.folder_flags().contains(FolderFlags::ARCHIVE);
        let inserted = {
            let mut q = self.update_queue.lock().await;
            if head_insert {
                q.push_front(folder.clone())
            } else {
                q.push_back(folder.clone())
            }
        };
        if inserted {
            let _ = self
                .events
                .send(SyncEvent::FolderAddedIntoQ(QueueKind::Update, folder.clone()));
        }
        let mut folders = self.folders.write().await;
        if let Some(fs) = folders.get_mut(folder) {
            fs.set_state(SyncState::UpdateNeeded);
        }
        Ok(())
    }

    pub async fn notify_download_queue_changed(&self, folder: &FolderUri) -> SyncResult<()> {
        if self.paused.load(Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut folders = self.folders.write().await;
            let fs = folders
                .get_mut(folder)
                .ok_or_else(|| SyncError::Fatal(format!("unknown folder {folder}")))?;
            fs.set_state(SyncState::ReadyToDownload);
        }
        self.insert_priority(folder).await?;

        let idle = *self.idle_state.lock().await;
        let can_start =
            self.config.download_model == DownloadModel::Parallel || !self.sibling_downloading(folder).await;
        if can_start && idle != IdleState::NotIdle {
            self.pump_folder(folder, Some(self.config.first_group_size_limit)).await?;
        }
        Ok(())
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.update_in_progress.store(false, Ordering::SeqCst);
    }

    pub async fn set_idle_state(&self, new: IdleState) {
        *self.idle_state.lock().await = new;
    }

    pub async fn idle_state(&self) -> IdleState {
        *self.idle_state.lock().await
    }

    // ---- priority-queue insertion -------------------------------------

    async fn insert_priority(&self, folder: &FolderUri) -> SyncResult<()> {
        let open_folders = self.open_folders.lock().await;
        let ids = self.identities.read().await;
        let mut pq = self.priority_queue.lock().await;
        let inserted = pq.insert_by(folder.clone(), |candidate, existing| {
            let (Some(c_id), Some(e_id)) = (ids.get(candidate), ids.get(existing)) else {
                return false;
            };
            let c_open = open_folders.contains(candidate);
            let e_open = open_folders.contains(existing);
            matches!(self.folder_strategy.compare(c_id, c_open, e_id, e_open), Priority::Higher)
        });
        drop(pq);
        drop(ids);
        drop(open_folders);
        if inserted {
            let _ = self
                .events
                .send(SyncEvent::FolderAddedIntoQ(QueueKind::Priority, folder.clone()));
        }
        Ok(())
    }

    async fn sibling_downloading(&self, folder: &FolderUri) -> bool {
        let Ok(identity) = self.identity(folder).await else {
            return false;
        };
        let folders = self.folders.read().await;
        let ids = self.identities.read().await;
        folders.iter().any(|(uri, fs)| {
            uri != folder
                && fs.state == SyncState::DownloadInProgress
                && ids.get(uri).map(|i| i.server_name.as_str()) == Some(identity.server_name.as_str())
        })
    }

    // ---- download pump (DownloadMessagesForOffline and its retry policy) ----

    /// Returns this folder's offline-store lock, creating it on first use.
    /// One lock per folder URI, held for the whole fetch-and-persist
    /// operation so two callers can never issue overlapping FETCHes against
    /// the same folder.
    async fn folder_download_lock(&self, folder: &FolderUri) -> Arc<Mutex<()>> {
        self.download_locks
            .lock()
            .await
            .entry(folder.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// The next `ReadyToDownload` folder in priority-queue order, excluding
    /// `exclude`. In Chained mode this is what a folder hands off to once
    /// its own turn ends, instead of the folder looping on itself forever.
    async fn next_ready_sibling(&self, exclude: &FolderUri) -> Option<FolderUri> {
        let pq = self.priority_queue.lock().await;
        let folders = self.folders.read().await;
        pq.iter()
            .find(|uri| *uri != exclude && folders.get(*uri).map(|f| f.state) == Some(SyncState::ReadyToDownload))
            .cloned()
    }

    async fn pump_folder(&self, folder: &FolderUri, first_limit: Option<u64>) -> SyncResult<()> {
        let mut current = folder.clone();
        let mut limit = first_limit.unwrap_or(self.config.group_size);
        loop {
            if self.paused.load(Ordering::SeqCst) {
                return Ok(());
            }
            if *self.idle_state.lock().await == IdleState::NotIdle {
                return Ok(());
            }
            if self.config.download_model != DownloadModel::Parallel && self.sibling_downloading(&current).await {
                return Ok(());
            }

            let folder_lock = self.folder_download_lock(&current).await;
            let _guard = match folder_lock.clone().try_lock_owned() {
                Ok(guard) => guard,
                Err(_) => {
                    let busy = SyncError::FolderBusy(current.to_string());
                    warn!(folder = %current, error = %busy, "folder's offline store is busy, postponing");
                    return Ok(());
                }
            };

            let group = {
                let mut folders = self.folders.write().await;
                let fs = folders
                    .get_mut(&current)
                    .ok_or_else(|| SyncError::Fatal(format!("unknown folder {current}")))?;
                fs.get_next_group(limit, &*self.store, &self.message_strategy, self.config.first_pass_size)
                    .await?
            };

            if group.is_empty() {
                self.finish_folder_no_pending(&current).await?;
                return Ok(());
            }

            {
                let mut folders = self.folders.write().await;
                folders.get_mut(&current).unwrap().set_state(SyncState::DownloadInProgress);
            }
            let total_in_folder = self.folders.read().await.get(&current).unwrap().download_queue_len();
            let _ = self.events.send(SyncEvent::DownloadStarted {
                folder: current.clone(),
                msgs_in_batch: group.len(),
                total_in_folder,
            });

            let outcome = self.protocol.fetch_message_bodies(&current, &group).await;
            match outcome.exit_code {
                ExitCode::Success => {
                    {
                        let mut folders = self.folders.write().await;
                        folders.get_mut(&current).unwrap().reset_retry_counter();
                    }
                    let has_pending = self.folders.read().await.get(&current).unwrap().has_pending_downloads();
                    if !has_pending {
                        self.finish_folder_no_pending(&current).await?;
                        return Ok(());
                    }
                    if self.config.download_model != DownloadModel::Parallel {
                        {
                            let mut folders = self.folders.write().await;
                            folders.get_mut(&current).unwrap().set_state(SyncState::ReadyToDownload);
                        }
                        match self.next_ready_sibling(&current).await {
                            Some(next) => {
                                current = next;
                                limit = self.config.group_size;
                                continue;
                            }
                            None => return Ok(()),
                        }
                    }
                    limit = self.config.group_size;
                }
                ExitCode::UserCancelled => return Ok(()),
                _ => {
                    let _ = self.events.send(SyncEvent::DownloadError(current.clone()));
                    let rolled_back = {
                        let mut folders = self.folders.write().await;
                        let fs = folders.get_mut(&current).unwrap();
                        let result = fs.rollback(self.config.group_retry_count);
                        fs.set_state(SyncState::ReadyToDownload);
                        result
                    };
                    match rolled_back {
                        Ok(()) => limit = self.config.group_size,
                        Err(()) => match self.next_ready_sibling(&current).await {
                            Some(next) => {
                                current = next;
                                limit = self.config.group_size;
                                continue;
                            }
                            None => return Ok(()),
                        },
                    }
                }
            }
        }
    }

    async fn finish_folder_no_pending(&self, folder: &FolderUri) -> SyncResult<()> {
        let removed = self.priority_queue.lock().await.remove(folder);
        {
            let mut folders = self.folders.write().await;
            if let Some(fs) = folders.get_mut(folder) {
                fs.set_state(SyncState::CompletedIdle);
            }
        }
        if removed {
            let _ = self
                .events
                .send(SyncEvent::FolderRemovedFromQ(QueueKind::Priority, folder.clone()));
        }
        let _ = self.events.send(SyncEvent::DownloadCompleted(folder.clone()));
        Ok(())
    }

    // ---- the periodic timer ------

    /// Returns `true` if the caller should stop the timer (both Discovery
    /// and Update queues are empty and the system is NotIdle).
    pub async fn timer_tick(&self) -> SyncResult<bool> {
        let idle = *self.idle_state.lock().await;
        let discovery_empty = self.discovery_queue.lock().await.is_empty();
        let update_empty = self.update_queue.lock().await.is_empty();
        if idle == IdleState::NotIdle && discovery_empty && update_empty {
            return Ok(true);
        }

        if !discovery_empty {
            self.tick_discovery().await?;
        }
        if !self.update_in_progress.load(Ordering::SeqCst) {
            self.tick_update().await?;
        }
        Ok(false)
    }

    async fn tick_discovery(&self) -> SyncResult<()> {
        let head = self.discovery_queue.lock().await.front().cloned();
        let Some(folder) = head else { return Ok(()) };

        let (processed, remaining) = {
            let mut folders = self.folders.write().await;
            let fs = folders
                .get_mut(&folder)
                .ok_or_else(|| SyncError::Fatal(format!("unknown folder {folder}")))?;
            fs.process_existing_headers(
                100,
                &*self.store,
                &self.message_strategy,
                self.config.offline_age_days_max,
                Utc::now(),
            )
            .await?
        };
        let _ = self.events.send(SyncEvent::DiscoveryQProcessed {
            folder: folder.clone(),
            processed,
            left_to_process: remaining,
        });

        if remaining == 0 {
            self.discovery_queue.lock().await.remove(&folder);
            let _ = self
                .events
                .send(SyncEvent::FolderRemovedFromQ(QueueKind::Discovery, folder.clone()));
            self.notify_download_queue_changed(&folder).await?;
        }
        Ok(())
    }

    async fn tick_update(&self) -> SyncResult<()> {
        let head = self.update_queue.lock().await.front().cloned();
        let Some(folder) = head else { return Ok(()) };

        let eligible = matches!(
            self.folders.read().await.get(&folder).map(|f| f.state),
            Some(SyncState::CompletedIdle) | Some(SyncState::UpdateNeeded)
        );
        self.update_queue.lock().await.remove(&folder);
        let _ = self
            .events
            .send(SyncEvent::FolderRemovedFromQ(QueueKind::Update, folder.clone()));

        if !eligible {
            return Ok(());
        }

        self.update_in_progress.store(true, Ordering::SeqCst);
        {
            let mut folders = self.folders.write().await;
            if let Some(fs) = folders.get_mut(&folder) {
                fs.set_state(SyncState::UpdateIssued);
            }
        }
        let result = self.run_update_folder(&folder).await;
        self.update_in_progress.store(false, Ordering::SeqCst);
        result
    }

    // ---- Update — UpdateFolder / SELECT completion ----

    async fn run_update_folder(&self, folder: &FolderUri) -> SyncResult<()> {
        let outcome = self.protocol.select_folder(folder).await;
        self.handle_select_outcome(folder, outcome).await
    }

    async fn handle_select_outcome(&self, folder: &FolderUri, outcome: UrlOutcome<SelectOutcome>) -> SyncResult<()> {
        match outcome.exit_code {
            ExitCode::Success => {
                let select = outcome.value.unwrap_or_default();
                let had_never_updated = self.folders.read().await.get(folder).map(|f| f.last_update_time == 0).unwrap_or(false);

                self.reconcile_uid_validity(folder, &select).await?;

                let counts = ServerCounts {
                    total: select.total,
                    recent: select.recent,
                    next_uid: select.uid_next.unwrap_or(0) as i64,
                };
                let local_db_empty = self.store.list_all_keys(folder).await?.is_empty();

                let mut folders = self.folders.write().await;
                let fs = folders
                    .get_mut(folder)
                    .ok_or_else(|| SyncError::Fatal(format!("unknown folder {folder}")))?;
                let changed = fs.update_server_counts(counts);
                fs.last_update_time = Utc::now().timestamp();

                // Recover from an empty local database on the very first
                // STATUS response after startup.
                let force = had_never_updated && select.total > 0 && local_db_empty;

                if changed || force {
                    fs.set_state(SyncState::UpdateIssued);
                } else {
                    fs.set_state(SyncState::CompletedIdle);
                }
                Ok(())
            }
            ExitCode::UserCancelled => Ok(()),
            _ => {
                warn!(folder = %folder, "select_folder failed, returning to idle");
                let mut folders = self.folders.write().await;
                if let Some(fs) = folders.get_mut(folder) {
                    fs.set_state(SyncState::CompletedIdle);
                }
                Ok(())
            }
        }
    }

    /// UID-validity reconciliation, run inside SELECT completion.
    async fn reconcile_uid_validity(&self, folder: &FolderUri, select: &SelectOutcome) -> SyncResult<()> {
        let local_validity = self.identities.read().await.get(folder).map(|i| i.uid_validity).unwrap_or(0);

        if local_validity != 0 && select.uid_validity != local_validity {
            info!(folder = %folder, old = local_validity, new = select.uid_validity, "uid-validity changed, resetting folder");
            self.store.reset_folder(folder).await?;
            self.store.drop_offline_ops_for_folder(folder).await?;
            {
                let mut folders = self.folders.write().await;
                if let Some(fs) = folders.get_mut(folder) {
                    fs.reset();
                }
            }
            {
                let mut ids = self.identities.write().await;
                if let Some(id) = ids.get_mut(folder) {
                    id.uid_validity = select.uid_validity;
                }
            }
            return self.fetch_new_headers(folder).await;
        }

        {
            let mut ids = self.identities.write().await;
            if let Some(id) = ids.get_mut(folder) {
                id.uid_validity = select.uid_validity;
            }
        }

        let mut existing = self.store.list_all_keys(folder).await?;
        existing.sort_unstable();

        match &select.flag_state {
            None => {
                for uid in existing {
                    self.store.delete_header(folder, uid).await?;
                }
            }
            Some(flag_state) if flag_state.partial => {
                for (uid, flags, server_deleted) in &flag_state.entries {
                    if *server_deleted {
                        self.maybe_delete_local(folder, *uid).await?;
                    } else if let Some(mut header) = self.store.get_header(folder, *uid).await? {
                        header.flags = *flags;
                        self.store.put_header(header).await?;
                    }
                }
            }
            Some(flag_state) => {
                let server_uids: HashSet<_> = flag_state.entries.iter().map(|(uid, _, _)| *uid).collect();
                for uid in &existing {
                    if !server_uids.contains(uid) {
                        self.store.delete_header(folder, *uid).await?;
                    }
                }
                for (uid, flags, server_deleted) in &flag_state.entries {
                    if *server_deleted {
                        self.maybe_delete_local(folder, *uid).await?;
                    } else if existing.binary_search(uid).is_ok() {
                        if let Some(mut header) = self.store.get_header(folder, *uid).await? {
                            header.flags = *flags;
                            self.store.put_header(header).await?;
                        }
                    }
                    // UIDs not in `existing`: their header content arrives via
                    // the header fetch the SELECT URL performed out of band;
                    // fetch_new_headers below picks them up once present.
                }
            }
        }
        self.fetch_new_headers(folder).await
    }

    async fn maybe_delete_local(&self, folder: &FolderUri, uid: crate::types::Uid) -> SyncResult<()> {
        if !self.config.show_deleted_messages {
            self.store.delete_header(folder, uid).await?;
        }
        Ok(())
    }

    async fn fetch_new_headers(&self, folder: &FolderUri) -> SyncResult<()> {
        let keys = self.store.list_all_keys(folder).await?;
        let mut candidates = Vec::new();
        for uid in keys {
            if let Some(header) = self.store.get_header(folder, uid).await? {
                if !header.is_offline {
                    candidates.push(header);
                }
            }
        }
        let inserted = {
            let mut folders = self.folders.write().await;
            let fs = folders
                .get_mut(folder)
                .ok_or_else(|| SyncError::Fatal(format!("unknown folder {folder}")))?;
            fs.insert_candidates(&candidates, &self.message_strategy, self.config.offline_age_days_max, Utc::now())
        };
        if !inserted.is_empty() {
            self.notify_download_queue_changed(folder).await?;
        }
        Ok(())
    }

    // ---- idle entry --

    pub async fn start_idle_processing(&self) -> SyncResult<()> {
        if self.paused.load(Ordering::SeqCst) || !self.startup_done.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.events.send(SyncEvent::StateChanged(true));

        for folder in self.effective_priority_queue().await {
            let ready = matches!(
                self.folders.read().await.get(&folder).map(|f| f.state),
                Some(SyncState::ReadyToDownload)
            );
            if ready {
                self.pump_folder(&folder, None).await?;
            }
        }

        self.auto_update_folders(Utc::now()).await
    }

    /// Compresses the priority queue to one entry per server in Chained
    /// mode, preferring a server's already-in-progress sibling so it is
    /// never preempted.
    async fn effective_priority_queue(&self) -> Vec<FolderUri> {
        let pq = self.priority_queue.lock().await;
        if self.config.download_model == DownloadModel::Parallel {
            return pq.iter().cloned().collect();
        }

        let folders = self.folders.read().await;
        let ids = self.identities.read().await;

        let mut in_progress_servers: HashSet<String> = HashSet::new();
        for uri in pq.iter() {
            if let (Some(fs), Some(id)) = (folders.get(uri), ids.get(uri)) {
                if fs.state == SyncState::DownloadInProgress {
                    in_progress_servers.insert(id.server_name.clone());
                }
            }
        }

        let mut by_server: HashMap<String, FolderUri> = HashMap::new();
        for uri in pq.iter() {
            let Some(id) = ids.get(uri) else { continue };
            if in_progress_servers.contains(&id.server_name) {
                continue;
            }
            by_server.entry(id.server_name.clone()).or_insert_with(|| uri.clone());
        }
        by_server.into_values().collect()
    }

    /// `AutoUpdateFolders`. Credential/login gating (skipping servers that
    /// never logged in, or are password-locked) is out of scope here since
    /// identity and credentials live outside this crate; every registered
    /// folder is considered eligible.
    pub async fn auto_update_folders(&self, now: DateTime<Utc>) -> SyncResult<()> {
        let now_ts = now.timestamp();
        let uris: Vec<FolderUri> = self.folders.read().await.keys().cloned().collect();

        for folder in uris {
            let Ok(identity) = self.identity(&folder).await else { continue };
            if !identity.folder_flags().contains(FolderFlags::OFFLINE_ENABLED) {
                continue;
            }
            if identity.folder_flags().contains(FolderFlags::NO_SELECT) {
                continue;
            }

            let (state, last_update, last_sync, queue_empty) = {
                let folders = self.folders.read().await;
                let fs = folders.get(&folder).unwrap();
                (fs.state, fs.last_update_time, fs.last_sync_time, !fs.has_pending_downloads())
            };

            if state == SyncState::UpdateIssued && queue_empty {
                let mut folders = self.folders.write().await;
                folders.get_mut(&folder).unwrap().set_state(SyncState::CompletedIdle);
                continue;
            }

            if matches!(state, SyncState::CompletedIdle | SyncState::UpdateNeeded | SyncState::UpdateIssued)
                && now_ts - last_update >= self.config.default_update_interval.as_secs() as i64
            {
                let inserted = self.update_queue.lock().await.push_back(folder.clone());
                if inserted {
                    let _ = self
                        .events
                        .send(SyncEvent::FolderAddedIntoQ(QueueKind::Update, folder.clone()));
                }
            }

            if now_ts - last_sync >= self.config.auto_sync_frequency.as_secs() as i64 {
                let inserted = self.discovery_queue.lock().await.push_back(folder.clone());
                if inserted {
                    let _ = self
                        .events
                        .send(SyncEvent::FolderAddedIntoQ(QueueKind::Discovery, folder.clone()));
                    let _ = self.events.send(SyncEvent::AutoSyncInitiated(folder.clone()));
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    async fn folder_state_snapshot(&self, folder: &FolderUri) -> Option<SyncState> {
        self.folders.read().await.get(folder).map(|f| f.state)
    }

    #[cfg(test)]
    async fn priority_queue_snapshot(&self) -> Vec<FolderUri> {
        self.priority_queue.lock().await.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AppendOutcome, CopyOutcome, StatusOutcome};
    use crate::store::MessageStore as _;
    use crate::types::{FolderCacheElement, MessageFlags, MessageHeader, Uid};
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex as StdMutex;

    struct FakeProtocol {
        fetch_result: ExitCode,
        /// Per-folder override of `fetch_result`, checked first. Lets a test
        /// make one folder fail while a sibling succeeds.
        fetch_overrides: StdMutex<StdHashMap<FolderUri, ExitCode>>,
    }

    impl FakeProtocol {
        fn new(fetch_result: ExitCode) -> Self {
            FakeProtocol { fetch_result, fetch_overrides: StdMutex::new(StdHashMap::new()) }
        }

        fn fail_folder(self, folder: FolderUri, code: ExitCode) -> Self {
            self.fetch_overrides.lock().unwrap().insert(folder, code);
            self
        }
    }

    #[async_trait]
    impl ProtocolEngine for FakeProtocol {
        async fn select_folder(&self, _folder: &FolderUri) -> UrlOutcome<SelectOutcome> {
            UrlOutcome::success(SelectOutcome::default())
        }
        async fn update_folder_status(&self, _folder: &FolderUri) -> UrlOutcome<StatusOutcome> {
            UrlOutcome::success(StatusOutcome::default())
        }
        async fn fetch_message_bodies(&self, folder: &FolderUri, _uids: &[Uid]) -> UrlOutcome<()> {
            let result = self
                .fetch_overrides
                .lock()
                .unwrap()
                .get(folder)
                .copied()
                .unwrap_or(self.fetch_result);
            if result == ExitCode::Success {
                UrlOutcome::success(())
            } else {
                UrlOutcome::failed(result)
            }
        }
        async fn store_flags(
            &self,
            _folder: &FolderUri,
            _uids: &[Uid],
            _add: bool,
            _mask: crate::protocol::FlagMask,
        ) -> UrlOutcome<()> {
            UrlOutcome::success(())
        }
        async fn store_keywords(
            &self,
            _folder: &FolderUri,
            _uids: &[Uid],
            _add: bool,
            _keywords: &crate::protocol::KeywordSet,
        ) -> UrlOutcome<()> {
            UrlOutcome::success(())
        }
        async fn copy_messages(
            &self,
            _source: &FolderUri,
            _uids: &[Uid],
            _dest: &FolderUri,
            _is_move: bool,
        ) -> UrlOutcome<CopyOutcome> {
            UrlOutcome::success(CopyOutcome::default())
        }
        async fn append_message(&self, _bytes: &[u8], _dest: &FolderUri) -> UrlOutcome<AppendOutcome> {
            UrlOutcome::success(AppendOutcome::default())
        }
        async fn create_folder(&self, _parent: &FolderUri, _name: &str) -> UrlOutcome<()> {
            UrlOutcome::success(())
        }
        async fn delete_all_messages(&self, _folder: &FolderUri) -> UrlOutcome<()> {
            UrlOutcome::success(())
        }
    }

    #[derive(Default)]
    struct FakeStore {
        headers: StdMutex<StdHashMap<Uid, MessageHeader>>,
    }

    impl FakeStore {
        fn with_headers(headers: Vec<MessageHeader>) -> Self {
            FakeStore {
                headers: StdMutex::new(headers.into_iter().map(|h| (h.uid, h)).collect()),
            }
        }
    }

    #[async_trait]
    impl MessageStore for FakeStore {
        async fn list_all_keys(&self, folder: &FolderUri) -> SyncResult<Vec<Uid>> {
            let mut keys: Vec<Uid> = self
                .headers
                .lock()
                .unwrap()
                .values()
                .filter(|h| &h.folder == folder)
                .map(|h| h.uid)
                .collect();
            keys.sort_unstable();
            Ok(keys)
        }
        async fn get_header(&self, folder: &FolderUri, uid: Uid) -> SyncResult<Option<MessageHeader>> {
            Ok(self
                .headers
                .lock()
                .unwrap()
                .get(&uid)
                .filter(|h| &h.folder == folder)
                .cloned())
        }
        async fn contains_key(&self, folder: &FolderUri, uid: Uid) -> SyncResult<bool> {
            Ok(self
                .headers
                .lock()
                .unwrap()
                .get(&uid)
                .is_some_and(|h| &h.folder == folder))
        }
        async fn put_header(&self, header: MessageHeader) -> SyncResult<()> {
            self.headers.lock().unwrap().insert(header.uid, header);
            Ok(())
        }
        async fn delete_header(&self, _folder: &FolderUri, uid: Uid) -> SyncResult<()> {
            self.headers.lock().unwrap().remove(&uid);
            Ok(())
        }
        async fn load_message_bytes(&self, _folder: &FolderUri, _uid: Uid) -> SyncResult<Option<Vec<u8>>> {
            Ok(None)
        }
        async fn store_message_bytes(&self, _folder: &FolderUri, _uid: Uid, _bytes: &[u8]) -> SyncResult<()> {
            Ok(())
        }
        async fn rename_key(&self, _folder: &FolderUri, old_uid: Uid, new_uid: Uid) -> SyncResult<()> {
            let mut map = self.headers.lock().unwrap();
            if let Some(mut h) = map.remove(&old_uid) {
                h.uid = new_uid;
                map.insert(new_uid, h);
            }
            Ok(())
        }
        async fn reset_folder(&self, _folder: &FolderUri) -> SyncResult<()> {
            self.headers.lock().unwrap().clear();
            Ok(())
        }
        async fn get_offline_op_for_key(
            &self,
            _folder: &FolderUri,
            _uid: Uid,
            _create_if_missing: bool,
        ) -> SyncResult<Option<crate::offline_op::OfflineOp>> {
            Ok(None)
        }
        async fn put_offline_op(&self, _op: crate::offline_op::OfflineOp) -> SyncResult<i64> {
            Ok(0)
        }
        async fn remove_offline_op(&self, _op_id: i64) -> SyncResult<()> {
            Ok(())
        }
        async fn list_offline_ops(&self, _folder: &FolderUri) -> SyncResult<Vec<crate::offline_op::OfflineOp>> {
            Ok(vec![])
        }
        async fn drop_offline_ops_for_folder(&self, _folder: &FolderUri) -> SyncResult<()> {
            Ok(())
        }
        async fn next_fake_offline_msg_key(&self) -> SyncResult<Uid> {
            Ok(crate::types::FAKE_UID_BASE)
        }
        async fn get_playback_cursor(&self, _folder: &FolderUri) -> SyncResult<usize> {
            Ok(0)
        }
        async fn set_playback_cursor(&self, _folder: &FolderUri, _pos: usize) -> SyncResult<()> {
            Ok(())
        }
        async fn get_folder_cache(&self, _folder: &FolderUri) -> SyncResult<FolderCacheElement> {
            Ok(FolderCacheElement::default())
        }
        async fn set_folder_cache(&self, _folder: &FolderUri, _cache: FolderCacheElement) -> SyncResult<()> {
            Ok(())
        }
        async fn find_pseudo_by_message_id(
            &self,
            _folder: &FolderUri,
            _message_id: &str,
        ) -> SyncResult<Option<Uid>> {
            Ok(None)
        }
    }

    fn inbox_identity() -> FolderIdentity {
        FolderIdentity {
            uri: FolderUri::from("imap://a/Inbox"),
            server_name: "a".into(),
            hierarchy_delimiter: '/',
            uid_validity: 1,
            uid_next: None,
            flags: FolderFlags::INBOX.bits() | FolderFlags::OFFLINE_ENABLED.bits(),
        }
    }

    fn header(uid: Uid, size: u64) -> MessageHeader {
        header_in(FolderUri::from("imap://a/Inbox"), uid, size)
    }

    fn header_in(folder: FolderUri, uid: Uid, size: u64) -> MessageHeader {
        MessageHeader {
            uid,
            folder,
            size,
            date: Utc::now(),
            flags: MessageFlags::default(),
            keywords: vec![],
            is_offline: false,
            pending_removal: false,
            message_id: None,
            server_thread: None,
            label: None,
        }
    }

    fn archive_identity() -> FolderIdentity {
        FolderIdentity {
            uri: FolderUri::from("imap://a/Archive"),
            server_name: "a".into(),
            hierarchy_delimiter: '/',
            uid_validity: 1,
            uid_next: None,
            flags: FolderFlags::ARCHIVE.bits() | FolderFlags::OFFLINE_ENABLED.bits(),
        }
    }

    #[tokio::test]
    async fn cold_start_single_batch() {
        let store = Arc::new(FakeStore::with_headers(vec![header(100, 1024), header(101, 1024), header(102, 1024)]));
        let protocol = Arc::new(FakeProtocol::new(ExitCode::Success));
        let (manager, mut rx) = SyncManager::new(
            SyncConfig::default(),
            protocol,
            store,
            FolderStrategy::default(),
            MessageStrategy::default(),
        );
        manager.register_folder(inbox_identity()).await;
        manager.mark_startup_done();
        manager.set_idle_state(IdleState::SystemIdle).await;

        manager
            .fetch_new_headers(&FolderUri::from("imap://a/Inbox"))
            .await
            .unwrap();

        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SyncEvent::DownloadCompleted(_)) {
                saw_completed = true;
            }
        }
        assert!(saw_completed);
        assert_eq!(
            manager.folder_state_snapshot(&FolderUri::from("imap://a/Inbox")).await,
            Some(SyncState::CompletedIdle)
        );
        assert!(manager.priority_queue_snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn paused_manager_never_issues_downloads() {
        let store = Arc::new(FakeStore::with_headers(vec![header(1, 10)]));
        let protocol = Arc::new(FakeProtocol::new(ExitCode::Success));
        let (manager, _rx) = SyncManager::new(
            SyncConfig::default(),
            protocol,
            store,
            FolderStrategy::default(),
            MessageStrategy::default(),
        );
        manager.register_folder(inbox_identity()).await;
        manager.mark_startup_done();
        manager.pause();

        manager
            .fetch_new_headers(&FolderUri::from("imap://a/Inbox"))
            .await
            .unwrap();

        assert_eq!(
            manager.folder_state_snapshot(&FolderUri::from("imap://a/Inbox")).await,
            Some(SyncState::ReadyToDownload)
        );
    }

    #[tokio::test]
    async fn retry_exhaustion_hands_off_chain() {
        let store = Arc::new(FakeStore::with_headers(vec![header(1, 10)]));
        let protocol = Arc::new(FakeProtocol::new(ExitCode::TransientNetwork));
        let mut config = SyncConfig::default();
        config.group_retry_count = 3;
        let (manager, _rx) =
            SyncManager::new(config, protocol, store, FolderStrategy::default(), MessageStrategy::default());
        manager.register_folder(inbox_identity()).await;
        manager.mark_startup_done();
        manager.set_idle_state(IdleState::SystemIdle).await;

        let folder = FolderUri::from("imap://a/Inbox");
        manager.fetch_new_headers(&folder).await.unwrap();
        assert_eq!(manager.folder_state_snapshot(&folder).await, Some(SyncState::ReadyToDownload));
    }

    #[tokio::test]
    async fn retry_exhaustion_hands_off_to_sibling() {
        let inbox = FolderUri::from("imap://a/Inbox");
        let archive = FolderUri::from("imap://a/Archive");
        let store = Arc::new(FakeStore::with_headers(vec![
            header_in(inbox.clone(), 1, 10),
            header_in(archive.clone(), 2, 10),
        ]));
        let protocol = Arc::new(
            FakeProtocol::new(ExitCode::Success).fail_folder(inbox.clone(), ExitCode::TransientNetwork),
        );
        let mut config = SyncConfig::default();
        config.group_retry_count = 3;
        config.download_model = DownloadModel::Chained;
        let (manager, _rx) =
            SyncManager::new(config, protocol, store, FolderStrategy::default(), MessageStrategy::default());
        manager.register_folder(inbox_identity()).await;
        manager.register_folder(archive_identity()).await;
        manager.mark_startup_done();

        // Discover both folders' pending messages while NotIdle so they land
        // in PriorityQueue as ReadyToDownload without either one pumping yet.
        manager.fetch_new_headers(&archive).await.unwrap();
        manager.fetch_new_headers(&inbox).await.unwrap();
        assert_eq!(manager.folder_state_snapshot(&inbox).await, Some(SyncState::ReadyToDownload));
        assert_eq!(manager.folder_state_snapshot(&archive).await, Some(SyncState::ReadyToDownload));

        // Now kick off Inbox's download pump with Archive still waiting as a
        // sibling. Inbox exhausts its retries and hands off to Archive within
        // the same pump_folder call, rather than stalling until some external
        // re-trigger reaches Archive separately.
        manager.set_idle_state(IdleState::SystemIdle).await;
        manager.notify_download_queue_changed(&inbox).await.unwrap();

        assert_eq!(manager.folder_state_snapshot(&inbox).await, Some(SyncState::ReadyToDownload));
        assert_eq!(manager.folder_state_snapshot(&archive).await, Some(SyncState::CompletedIdle));
    }
}
