//! Per-folder sync state machine and download queue.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::errors::SyncResult;
use crate::store::MessageStore;
use crate::strategy::MessageStrategy;
use crate::types::{FolderUri, MessageHeader, ServerCounts, Uid};

/// `FolderSyncState`'s state machine. Discriminants are assigned explicit
/// ordinal values so `as i32` is stable across reorderings of this enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    CompletedIdle = 0,
    StatusIssued = 1,
    UpdateNeeded = 2,
    UpdateIssued = 3,
    ReadyToDownload = 4,
    DownloadInProgress = 5,
}

/// One per offline-enabled folder. Holds the folder's key rather than a
/// reference to it — lookups go through the owning `SyncManager`'s arena.
#[derive(Debug, Clone)]
pub struct FolderSyncState {
    pub folder: FolderUri,
    pub state: SyncState,

    download_queue: Vec<Uid>,
    download_set: HashSet<Uid>,
    download_queue_changed: bool,
    offset: usize,
    last_offset: usize,

    existing_headers_queue: Vec<Uid>,
    process_pointer: usize,
    discovery_initialized: bool,

    pub last_sync_time: i64,
    pub last_update_time: i64,
    pub last_counts: ServerCounts,
    pub has_status_response: bool,

    pub retry_counter: u32,
}

impl FolderSyncState {
    pub fn new(folder: FolderUri) -> Self {
        FolderSyncState {
            folder,
            state: SyncState::CompletedIdle,
            download_queue: Vec::new(),
            download_set: HashSet::new(),
            download_queue_changed: false,
            offset: 0,
            last_offset: 0,
            existing_headers_queue: Vec::new(),
            process_pointer: 0,
            discovery_initialized: false,
            last_sync_time: 0,
            last_update_time: 0,
            last_counts: ServerCounts::default(),
            has_status_response: false,
            retry_counter: 0,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn last_offset(&self) -> usize {
        self.last_offset
    }

    pub fn download_queue_len(&self) -> usize {
        self.download_queue.len()
    }

    pub fn download_queue(&self) -> &[Uid] {
        &self.download_queue
    }

    pub fn has_pending_downloads(&self) -> bool {
        self.offset < self.download_queue.len()
    }

    /// Idempotent state transition: repeated notification of the same event
    /// is always safe to apply again. A transition into `CompletedIdle`
    /// always clears the download queue.
    pub fn set_state(&mut self, new: SyncState) {
        if self.state == new {
            return;
        }
        self.state = new;
        if new == SyncState::CompletedIdle {
            self.reset();
        }
    }

    /// Clears both queues and both offsets to zero.
    pub fn reset(&mut self) {
        self.download_queue.clear();
        self.download_set.clear();
        self.offset = 0;
        self.last_offset = 0;
        self.download_queue_changed = false;
    }

    /// Insert path for candidate headers fresh from Discovery or a new-header
    /// notification. Returns the UIDs actually inserted. `download_set`
    /// always mirrors `download_queue`'s contents by construction: every
    /// push to one is mirrored into the other.
    pub fn insert_candidates(
        &mut self,
        candidates: &[MessageHeader],
        message_strategy: &MessageStrategy,
        offline_age_days_max: i64,
        now: DateTime<Utc>,
    ) -> Vec<Uid> {
        let mut inserted = Vec::new();
        for header in candidates {
            if self.download_set.contains(&header.uid) {
                continue;
            }
            if message_strategy.excluded(header, offline_age_days_max, now) {
                continue;
            }
            if header.is_offline {
                continue;
            }
            if header.size == 0 {
                continue;
            }
            self.download_queue.push(header.uid);
            self.download_set.insert(header.uid);
            inserted.push(header.uid);
        }
        if !inserted.is_empty() {
            self.download_queue_changed = true;
        }
        inserted
    }

    /// Returns a contiguous prefix of the sorted pending queue whose
    /// cumulative size is <= `limit`, skipping stale entries along the way.
    /// A lone oversized message is still returned by itself rather than
    /// stalling the queue forever.
    pub async fn get_next_group(
        &mut self,
        limit: u64,
        store: &dyn MessageStore,
        message_strategy: &MessageStrategy,
        first_pass_size: u64,
    ) -> SyncResult<Vec<Uid>> {
        self.drop_stale_entries(store).await?;

        if self.download_queue_changed {
            self.sort_pending_subrange(store, message_strategy, first_pass_size).await?;
            self.download_queue_changed = false;
        }

        let mut group = Vec::new();
        let mut total_size: u64 = 0;
        let mut idx = self.offset;

        while idx < self.download_queue.len() {
            let uid = self.download_queue[idx];
            let header = store.get_header(&self.folder, uid).await?;
            let size = header.map(|h| h.size).unwrap_or(0);

            if group.is_empty() {
                // sole-element exception: always take the first pending message.
                group.push(uid);
                total_size = size;
                idx += 1;
                if size > limit {
                    break;
                }
                continue;
            }

            if total_size + size > limit {
                break;
            }
            group.push(uid);
            total_size += size;
            idx += 1;
        }

        debug!(
            folder = %self.folder,
            group_len = group.len(),
            group_bytes = total_size,
            "get_next_group computed batch"
        );

        self.last_offset = self.offset;
        self.offset = idx;
        Ok(group)
    }

    async fn drop_stale_entries(&mut self, store: &dyn MessageStore) -> SyncResult<()> {
        let mut kept = Vec::with_capacity(self.download_queue.len());
        for uid in self.download_queue.drain(..).collect::<Vec<_>>() {
            if store.contains_key(&self.folder, uid).await? {
                kept.push(uid);
            } else {
                self.download_set.remove(&uid);
            }
        }
        self.download_queue = kept;
        Ok(())
    }

    /// Sorts only the pending sub-range (indices >= offset), preserving
    /// already-downloaded entries' order. Run before computing the next
    /// download group whenever the queue changed since the last sort.
    async fn sort_pending_subrange(
        &mut self,
        store: &dyn MessageStore,
        message_strategy: &MessageStrategy,
        first_pass_size: u64,
    ) -> SyncResult<()> {
        if self.offset >= self.download_queue.len() {
            return Ok(());
        }
        let mut pending: Vec<(Uid, MessageHeader)> = Vec::new();
        for &uid in &self.download_queue[self.offset..] {
            if let Some(header) = store.get_header(&self.folder, uid).await? {
                pending.push((uid, header));
            }
        }
        pending.sort_by(|(_, a), (_, b)| message_strategy.compare(a, b, first_pass_size));
        let sorted_uids: Vec<Uid> = pending.into_iter().map(|(uid, _)| uid).collect();
        self.download_queue.truncate(self.offset);
        self.download_queue.extend(sorted_uids);
        Ok(())
    }

    /// Restores `Offset <- LastOffset` so a failed batch is re-attempted.
    /// Bounded by `group_retry_count`: the call that makes the *n*th
    /// consecutive failure where *n* equals the limit fails instead, and the
    /// counter resets.
    pub fn rollback(&mut self, group_retry_count: u32) -> Result<(), ()> {
        self.retry_counter += 1;
        if self.retry_counter >= group_retry_count {
            self.retry_counter = 0;
            Err(())
        } else {
            self.offset = self.last_offset;
            Ok(())
        }
    }

    pub fn reset_retry_counter(&mut self) {
        self.retry_counter = 0;
    }

    /// Discovery step.
    /// Returns `(processed, remaining)`: how many headers this call actually
    /// scanned (at most `n_headers`, fewer on the final partial batch) and
    /// how many are still unscanned. `remaining == 0` means the scan is done.
    pub async fn process_existing_headers(
        &mut self,
        n_headers: usize,
        store: &dyn MessageStore,
        message_strategy: &MessageStrategy,
        offline_age_days_max: i64,
        now: DateTime<Utc>,
    ) -> SyncResult<(usize, usize)> {
        if !self.discovery_initialized {
            let mut uids = store.list_all_keys(&self.folder).await?;
            uids.sort_unstable();
            self.existing_headers_queue = uids;
            self.process_pointer = 0;
            self.discovery_initialized = true;
        }

        let end = (self.process_pointer + n_headers).min(self.existing_headers_queue.len());
        let batch: Vec<Uid> = self.existing_headers_queue[self.process_pointer..end].to_vec();
        let processed = batch.len();

        let mut candidates = Vec::new();
        for uid in batch {
            if let Some(header) = store.get_header(&self.folder, uid).await? {
                if !header.is_offline {
                    candidates.push(header);
                }
            }
        }
        self.insert_candidates(&candidates, message_strategy, offline_age_days_max, now);

        self.process_pointer = end;
        let remaining = self.existing_headers_queue.len() - self.process_pointer;
        if remaining == 0 {
            self.last_sync_time = now.timestamp();
            self.discovery_initialized = false;
        }
        Ok((processed, remaining))
    }

    pub fn update_server_counts(&mut self, counts: ServerCounts) -> bool {
        let changed = counts != self.last_counts;
        self.last_counts = counts;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MessageStore as _;
    use crate::types::{FolderCacheElement, MessageFlags};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    /// Minimal in-memory `MessageStore` used to exercise the queue logic
    /// without pulling in sqlx.
    #[derive(Default)]
    struct FakeStore {
        headers: StdMutex<HashMap<Uid, MessageHeader>>,
    }

    impl FakeStore {
        fn with_headers(headers: Vec<MessageHeader>) -> Self {
            let map = headers.into_iter().map(|h| (h.uid, h)).collect();
            FakeStore {
                headers: StdMutex::new(map),
            }
        }
    }

    #[async_trait]
    impl MessageStore for FakeStore {
        async fn list_all_keys(&self, _folder: &FolderUri) -> SyncResult<Vec<Uid>> {
            let mut keys: Vec<Uid> = self.headers.lock().unwrap().keys().copied().collect();
            keys.sort_unstable();
            Ok(keys)
        }
        async fn get_header(&self, _folder: &FolderUri, uid: Uid) -> SyncResult<Option<MessageHeader>> {
            Ok(self.headers.lock().unwrap().get(&uid).cloned())
        }
        async fn contains_key(&self, _folder: &FolderUri, uid: Uid) -> SyncResult<bool> {
            Ok(self.headers.lock().unwrap().contains_key(&uid))
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

    fn header(uid: Uid, size: u64, date: DateTime<Utc>) -> MessageHeader {
        MessageHeader {
            uid,
            folder: FolderUri::from("imap://a/Inbox"),
            size,
            date,
            flags: MessageFlags::default(),
            keywords: vec![],
            is_offline: false,
            pending_removal: false,
            message_id: None,
            server_thread: None,
            label: None,
        }
    }

    #[tokio::test]
    async fn cold_start_single_batch() {
        let now = Utc::now();
        let headers = vec![header(100, 1024, now), header(101, 1024, now), header(102, 1024, now)];
        let store = FakeStore::with_headers(headers.clone());
        let mut fs = FolderSyncState::new(FolderUri::from("imap://a/Inbox"));
        let strategy = MessageStrategy::default();

        let inserted = fs.insert_candidates(&headers, &strategy, 0, now);
        assert_eq!(inserted.len(), 3);

        let group = fs
            .get_next_group(50 * 1024, &store, &strategy, 300 * 1024)
            .await
            .unwrap();
        assert_eq!(group, vec![100, 101, 102]);
        assert_eq!(fs.offset(), 3);

        let next = fs.get_next_group(50 * 1024, &store, &strategy, 300 * 1024).await.unwrap();
        assert!(next.is_empty());
    }

    #[tokio::test]
    async fn mixed_sizes_first_pass_threshold() {
        let now = Utc::now();
        let newer_small = header(1, 2 * 1024, now);
        let older_small = header(2, 4 * 1024, now - chrono::Duration::days(1));
        let large1 = header(3, 512 * 1024, now - chrono::Duration::days(2));
        let large2 = header(4, 700 * 1024, now - chrono::Duration::days(3));
        let headers = vec![large2.clone(), large1.clone(), older_small.clone(), newer_small.clone()];
        let store = FakeStore::with_headers(headers.clone());
        let mut fs = FolderSyncState::new(FolderUri::from("imap://a/Inbox"));
        let strategy = MessageStrategy::default();
        fs.insert_candidates(&headers, &strategy, 0, now);

        let g1 = fs.get_next_group(50 * 1024, &store, &strategy, 100 * 1024).await.unwrap();
        assert_eq!(g1, vec![1, 2]);
        assert_eq!(fs.offset(), 2);

        let g2 = fs.get_next_group(50 * 1024, &store, &strategy, 100 * 1024).await.unwrap();
        assert_eq!(g2, vec![3]);
        assert_eq!(fs.last_offset(), 2);
        assert_eq!(fs.offset(), 3);

        let g3 = fs.get_next_group(50 * 1024, &store, &strategy, 100 * 1024).await.unwrap();
        assert_eq!(g3, vec![4]);
        assert_eq!(fs.offset(), 4);

        let g4 = fs.get_next_group(50 * 1024, &store, &strategy, 100 * 1024).await.unwrap();
        assert!(g4.is_empty());
    }

    #[test]
    fn retry_exhaustion_resets_group() {
        let mut fs = FolderSyncState::new(FolderUri::from("imap://a/Inbox"));
        assert_eq!(fs.rollback(3), Ok(()));
        assert_eq!(fs.retry_counter, 1);
        assert_eq!(fs.rollback(3), Ok(()));
        assert_eq!(fs.retry_counter, 2);
        assert_eq!(fs.rollback(3), Err(()));
        assert_eq!(fs.retry_counter, 0);
    }

    #[test]
    fn zero_size_messages_never_inserted() {
        let now = Utc::now();
        let mut fs = FolderSyncState::new(FolderUri::from("imap://a/Inbox"));
        let strategy = MessageStrategy::default();
        let zero = header(1, 0, now);
        let inserted = fs.insert_candidates(&[zero], &strategy, 0, now);
        assert!(inserted.is_empty());
        assert_eq!(fs.download_queue_len(), 0);
    }

    #[test]
    fn completed_idle_transition_resets_queue() {
        let now = Utc::now();
        let mut fs = FolderSyncState::new(FolderUri::from("imap://a/Inbox"));
        let strategy = MessageStrategy::default();
        fs.insert_candidates(&[header(1, 10, now)], &strategy, 0, now);
        assert_eq!(fs.download_queue_len(), 1);
        fs.set_state(SyncState::DownloadInProgress);
        fs.set_state(SyncState::CompletedIdle);
        assert_eq!(fs.download_queue_len(), 0);
    }

    #[tokio::test]
    async fn discovery_is_monotonic_until_reset() {
        let now = Utc::now();
        let headers: Vec<_> = (1..=5u32).map(|i| header(i, 10, now)).collect();
        let store = FakeStore::with_headers(headers);
        let mut fs = FolderSyncState::new(FolderUri::from("imap://a/Inbox"));
        let strategy = MessageStrategy::default();

        let r1 = fs
            .process_existing_headers(2, &store, &strategy, 0, now)
            .await
            .unwrap();
        assert_eq!(r1, (2, 3));
        let r2 = fs
            .process_existing_headers(2, &store, &strategy, 0, now)
            .await
            .unwrap();
        assert_eq!(r2, (2, 1));
        let r3 = fs
            .process_existing_headers(2, &store, &strategy, 0, now)
            .await
            .unwrap();
        assert_eq!(r3, (1, 0));
        assert_eq!(fs.download_queue_len(), 5);
    }
}
