//! The `MessageStore` boundary.
//!
//! The message database / header store itself lives outside this crate; the
//! core only calls this trait to list UIDs, create/delete headers,
//! read/write per-message flags, and create offline-operation records.

use async_trait::async_trait;

use crate::errors::SyncResult;
use crate::offline_op::{OfflineOp, OfflineOpId};
use crate::types::{FolderCacheElement, FolderUri, MessageHeader, Uid};

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn list_all_keys(&self, folder: &FolderUri) -> SyncResult<Vec<Uid>>;

    async fn get_header(&self, folder: &FolderUri, uid: Uid) -> SyncResult<Option<MessageHeader>>;

    async fn contains_key(&self, folder: &FolderUri, uid: Uid) -> SyncResult<bool>;

    async fn put_header(&self, header: MessageHeader) -> SyncResult<()>;

    async fn delete_header(&self, folder: &FolderUri, uid: Uid) -> SyncResult<()>;

    /// Reads a downloaded body back off local storage. Used by cross-server
    /// copy/move playback to re-append a message at its destination.
    async fn load_message_bytes(&self, folder: &FolderUri, uid: Uid) -> SyncResult<Option<Vec<u8>>>;

    async fn store_message_bytes(&self, folder: &FolderUri, uid: Uid, bytes: &[u8]) -> SyncResult<()>;

    /// Changes a row's key from `old_uid` to `new_uid`, preserving all other
    /// fields.
    async fn rename_key(&self, folder: &FolderUri, old_uid: Uid, new_uid: Uid) -> SyncResult<()>;

    /// Discards every header in `folder` and recreates an empty database for
    /// it, preserving only the cached folder-level info. Called when a
    /// SELECT reports a UIDVALIDITY that no longer matches the local copy.
    async fn reset_folder(&self, folder: &FolderUri) -> SyncResult<()>;

    async fn get_offline_op_for_key(
        &self,
        folder: &FolderUri,
        uid: Uid,
        create_if_missing: bool,
    ) -> SyncResult<Option<OfflineOp>>;

    async fn put_offline_op(&self, op: OfflineOp) -> SyncResult<OfflineOpId>;

    async fn remove_offline_op(&self, op_id: OfflineOpId) -> SyncResult<()>;

    async fn list_offline_ops(&self, folder: &FolderUri) -> SyncResult<Vec<OfflineOp>>;

    /// Drops every offline operation for `folder`. Called on a UID-validity
    /// reset, since offline ops keyed to the old UIDs no longer apply.
    async fn drop_offline_ops_for_folder(&self, folder: &FolderUri) -> SyncResult<()>;

    /// Next value from the reserved fake-UID range.
    async fn next_fake_offline_msg_key(&self) -> SyncResult<Uid>;

    /// Resume cursor into a folder's offline-operation list, surviving a
    /// crash mid-playback.
    async fn get_playback_cursor(&self, folder: &FolderUri) -> SyncResult<usize>;

    async fn set_playback_cursor(&self, folder: &FolderUri, pos: usize) -> SyncResult<()>;

    async fn get_folder_cache(&self, folder: &FolderUri) -> SyncResult<FolderCacheElement>;

    async fn set_folder_cache(&self, folder: &FolderUri, cache: FolderCacheElement) -> SyncResult<()>;

    /// Finds a pending pseudo header in `folder` by message-id string,
    /// case-sensitive, angle brackets stripped. An empty or missing
    /// message-id is always treated as no-match, never a wildcard.
    async fn find_pseudo_by_message_id(
        &self,
        folder: &FolderUri,
        message_id: &str,
    ) -> SyncResult<Option<Uid>>;
}

/// Normalizes a message-id string for rename matching: strips surrounding
/// angle brackets, leaves case untouched (match is case-sensitive).
pub fn normalize_message_id(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.trim_start_matches('<').trim_end_matches('>'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_message_id_never_matches() {
        assert_eq!(normalize_message_id(""), None);
        assert_eq!(normalize_message_id("   "), None);
    }

    #[test]
    fn strips_angle_brackets() {
        assert_eq!(normalize_message_id("<abc@x>"), Some("abc@x"));
        assert_eq!(normalize_message_id("abc@x"), Some("abc@x"));
    }
}
