//! Idle/online state glue.
//!
//! `IdleDetector` turns OS/app idle signals and connectivity changes into
//! calls on `SyncManager`; nothing here talks to the OS directly — the
//! caller (an event loop, a D-Bus listener, whatever the host provides)
//! reports events through this small enum.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info};

use crate::errors::SyncResult;
use crate::sync::manager::{IdleState, SyncManager};
use crate::sync::{QueueKind, SyncEvent};

/// External signal fed into `IdleDetector::handle`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdleEvent {
    OsIdle,
    OsActive,
    AppIdle,
    AppActive,
    GoingOffline,
    BackOnline,
    Shutdown,
}

pub struct IdleDetector {
    manager: Arc<SyncManager>,
    os_idle: bool,
    app_idle: bool,
}

impl IdleDetector {
    pub fn new(manager: Arc<SyncManager>) -> Self {
        IdleDetector {
            manager,
            os_idle: false,
            app_idle: false,
        }
    }

    /// Dispatches one idle/online event. OS and app idle are
    /// tracked independently; either one being idle is enough to enter
    /// `SystemIdle`/`AppIdle` and trigger `StartIdleProcessing`.
    pub async fn handle(&mut self, event: IdleEvent) -> SyncResult<()> {
        match event {
            IdleEvent::OsIdle => {
                self.os_idle = true;
                self.enter_idle(IdleState::SystemIdle).await?;
            }
            IdleEvent::OsActive => {
                self.os_idle = false;
                self.maybe_leave_idle().await;
            }
            IdleEvent::AppIdle => {
                self.app_idle = true;
                self.enter_idle(IdleState::AppIdle).await?;
            }
            IdleEvent::AppActive => {
                self.app_idle = false;
                self.maybe_leave_idle().await;
            }
            IdleEvent::GoingOffline => {
                info!("connectivity lost, pausing sync");
                self.manager.pause();
            }
            IdleEvent::BackOnline => {
                info!("connectivity restored, resuming sync");
                self.manager.resume();
            }
            IdleEvent::Shutdown => {
                debug!("shutdown requested");
                self.manager.pause();
            }
        }
        Ok(())
    }

    async fn enter_idle(&self, state: IdleState) -> SyncResult<()> {
        self.manager.set_idle_state(state).await;
        self.manager.start_idle_processing().await
    }

    async fn maybe_leave_idle(&self) {
        if !self.os_idle && !self.app_idle {
            self.manager.set_idle_state(IdleState::NotIdle).await;
        }
    }
}

/// Drives the periodic timer tick, started lazily when either the Discovery
/// or Update queue becomes non-empty and stopped once `timer_tick` reports
/// both queues empty and the system `NotIdle`. While stopped, the loop waits
/// on the event broadcast for the next `FolderAddedIntoQ` rather than
/// ticking unconditionally in the background.
pub async fn run_timer_loop(manager: Arc<SyncManager>, period: Duration) {
    let mut ticker = interval(period);
    let mut events = manager.subscribe();
    let mut running = true;
    loop {
        if running {
            ticker.tick().await;
            match manager.timer_tick().await {
                Ok(true) => {
                    debug!("discovery/update queues drained, stopping periodic timer");
                    running = false;
                }
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "timer tick failed"),
            }
            continue;
        }

        match wait_for_queue_wakeup(&mut events).await {
            WakeupResult::Wake => {
                running = true;
                ticker.reset();
            }
            WakeupResult::ChannelClosed => return,
        }
    }
}

enum WakeupResult {
    Wake,
    ChannelClosed,
}

/// Blocks until a folder is queued into Discovery or Update, a broadcast lag
/// is reported (treated as "something may have happened, re-check"), or the
/// channel closes because `SyncManager` was dropped.
async fn wait_for_queue_wakeup(events: &mut broadcast::Receiver<SyncEvent>) -> WakeupResult {
    loop {
        match events.recv().await {
            Ok(SyncEvent::FolderAddedIntoQ(QueueKind::Discovery | QueueKind::Update, _)) => {
                return WakeupResult::Wake;
            }
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => return WakeupResult::Wake,
            Err(broadcast::error::RecvError::Closed) => return WakeupResult::ChannelClosed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::protocol::{AppendOutcome, CopyOutcome, ExitCode, ProtocolEngine, SelectOutcome, StatusOutcome, UrlOutcome};
    use crate::protocol::FlagMask;
    use crate::store::MessageStore;
    use crate::strategy::{FolderStrategy, MessageStrategy};
    use crate::types::{FolderCacheElement, FolderUri, MessageHeader, Uid};
    use async_trait::async_trait;

    struct NullProtocol;

    #[async_trait]
    impl ProtocolEngine for NullProtocol {
        async fn select_folder(&self, _folder: &FolderUri) -> UrlOutcome<SelectOutcome> {
            UrlOutcome::success(SelectOutcome::default())
        }
        async fn update_folder_status(&self, _folder: &FolderUri) -> UrlOutcome<StatusOutcome> {
            UrlOutcome::success(StatusOutcome::default())
        }
        async fn fetch_message_bodies(&self, _folder: &FolderUri, _uids: &[Uid]) -> UrlOutcome<()> {
            UrlOutcome::success(())
        }
        async fn store_flags(&self, _folder: &FolderUri, _uids: &[Uid], _add: bool, _mask: FlagMask) -> UrlOutcome<()> {
            UrlOutcome::success(())
        }
        async fn store_keywords(&self, _folder: &FolderUri, _uids: &[Uid], _add: bool, _keywords: &crate::protocol::KeywordSet) -> UrlOutcome<()> {
            UrlOutcome::success(())
        }
        async fn copy_messages(&self, _source: &FolderUri, _uids: &[Uid], _dest: &FolderUri, _is_move: bool) -> UrlOutcome<CopyOutcome> {
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
    struct NullStore;

    #[async_trait]
    impl MessageStore for NullStore {
        async fn list_all_keys(&self, _folder: &FolderUri) -> SyncResult<Vec<Uid>> {
            Ok(vec![])
        }
        async fn get_header(&self, _folder: &FolderUri, _uid: Uid) -> SyncResult<Option<MessageHeader>> {
            Ok(None)
        }
        async fn contains_key(&self, _folder: &FolderUri, _uid: Uid) -> SyncResult<bool> {
            Ok(false)
        }
        async fn put_header(&self, _header: MessageHeader) -> SyncResult<()> {
            Ok(())
        }
        async fn delete_header(&self, _folder: &FolderUri, _uid: Uid) -> SyncResult<()> {
            Ok(())
        }
        async fn load_message_bytes(&self, _folder: &FolderUri, _uid: Uid) -> SyncResult<Option<Vec<u8>>> {
            Ok(None)
        }
        async fn store_message_bytes(&self, _folder: &FolderUri, _uid: Uid, _bytes: &[u8]) -> SyncResult<()> {
            Ok(())
        }
        async fn rename_key(&self, _folder: &FolderUri, _old_uid: Uid, _new_uid: Uid) -> SyncResult<()> {
            Ok(())
        }
        async fn reset_folder(&self, _folder: &FolderUri) -> SyncResult<()> {
            Ok(())
        }
        async fn get_offline_op_for_key(&self, _folder: &FolderUri, _uid: Uid, _create_if_missing: bool) -> SyncResult<Option<crate::offline_op::OfflineOp>> {
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
        async fn find_pseudo_by_message_id(&self, _folder: &FolderUri, _message_id: &str) -> SyncResult<Option<Uid>> {
            Ok(None)
        }
    }

    fn manager() -> Arc<SyncManager> {
        let (m, _rx) = SyncManager::new(
            SyncConfig::default(),
            Arc::new(NullProtocol),
            Arc::new(NullStore::default()),
            FolderStrategy::default(),
            MessageStrategy::default(),
        );
        Arc::new(m)
    }

    #[tokio::test]
    async fn os_idle_then_active_clears_idle_state() {
        let m = manager();
        let mut detector = IdleDetector::new(m.clone());
        detector.handle(IdleEvent::OsIdle).await.unwrap();
        assert_eq!(m.idle_state().await, IdleState::SystemIdle);
        detector.handle(IdleEvent::OsActive).await.unwrap();
        assert_eq!(m.idle_state().await, IdleState::NotIdle);
    }

    #[tokio::test]
    async fn app_idle_independent_of_os_idle() {
        let m = manager();
        let mut detector = IdleDetector::new(m.clone());
        detector.handle(IdleEvent::OsIdle).await.unwrap();
        detector.handle(IdleEvent::AppIdle).await.unwrap();
        detector.handle(IdleEvent::OsActive).await.unwrap();
        // App is still idle, so overall idle state must not clear yet.
        assert_ne!(m.idle_state().await, IdleState::NotIdle);
        detector.handle(IdleEvent::AppActive).await.unwrap();
        assert_eq!(m.idle_state().await, IdleState::NotIdle);
    }

    #[tokio::test]
    async fn going_offline_pauses_manager() {
        let m = manager();
        m.mark_startup_done();
        let mut rx = m.subscribe();
        let mut detector = IdleDetector::new(m.clone());
        detector.handle(IdleEvent::GoingOffline).await.unwrap();
        // start_idle_processing is a no-op while paused: no StateChanged event fires.
        m.start_idle_processing().await.unwrap();
        assert!(rx.try_recv().is_err());
        detector.handle(IdleEvent::BackOnline).await.unwrap();
        m.start_idle_processing().await.unwrap();
        assert!(rx.try_recv().is_ok());
    }
}
