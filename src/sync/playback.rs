//! Offline-operation playback.
//!
//! Runs whenever the client transitions online, or synchronously right
//! after an optimistic offline move/copy. Replays queued operations per
//! folder in the fixed total order `PLAYBACK_ORDER`, coalescing consecutive
//! same-parameter records into a single URL.

use std::sync::Arc;

use tracing::{info, warn};

use crate::errors::SyncResult;
use crate::offline_op::{coalesce, CoalesceKey, OfflineOp, OfflineOpKind, PLAYBACK_ORDER};
use crate::protocol::{ExitCode, ProtocolEngine};
use crate::store::{normalize_message_id, MessageStore};
use crate::types::{FolderUri, MessageFlags, Uid};

/// One folder's worth of outer-pass metadata. `parent`/`name` are only
/// needed when `created_offline` is set.
#[derive(Clone, Debug)]
pub struct PlaybackFolderInfo {
    pub uri: FolderUri,
    pub parent: Option<FolderUri>,
    pub name: String,
    pub created_offline: bool,
}

#[derive(Debug, Default)]
pub struct PlaybackReport {
    pub completed: Vec<FolderUri>,
    pub resync_needed: Vec<FolderUri>,
    pub aborted: Option<FolderUri>,
}

enum FolderOutcome {
    Completed,
    ResyncNeeded,
    Aborted,
}

enum KindOutcome {
    Done,
    Aborted,
    ResyncNeeded,
}

enum DispatchOutcome {
    Success,
    TransientRetry,
    NonRetryableFailure,
}

pub struct OfflinePlayback {
    protocol: Arc<dyn ProtocolEngine>,
    store: Arc<dyn MessageStore>,
}

impl OfflinePlayback {
    pub fn new(protocol: Arc<dyn ProtocolEngine>, store: Arc<dyn MessageStore>) -> Self {
        OfflinePlayback { protocol, store }
    }

    /// Runs the full outer pass for one server.
    pub async fn run_server(&self, folders: &[PlaybackFolderInfo]) -> SyncResult<PlaybackReport> {
        let mut report = PlaybackReport::default();

        for f in folders.iter().filter(|f| f.created_offline) {
            let Some(parent) = &f.parent else { continue };
            let outcome = self.protocol.create_folder(parent, &f.name).await;
            if !outcome.exit_code.is_success() {
                warn!(folder = %f.uri, "CREATE for offline-created folder failed, aborting playback for server");
                report.aborted = Some(f.uri.clone());
                return Ok(report);
            }
        }

        for f in folders {
            match self.run_folder(&f.uri).await? {
                FolderOutcome::Completed => report.completed.push(f.uri.clone()),
                FolderOutcome::ResyncNeeded => report.resync_needed.push(f.uri.clone()),
                FolderOutcome::Aborted => {
                    report.aborted = Some(f.uri.clone());
                    break;
                }
            }
        }
        Ok(report)
    }

    /// Inner operation pass for one folder, resuming from the persisted
    /// cursor (an index into `PLAYBACK_ORDER`) so a crash mid-playback does
    /// not redo kinds already flushed.
    async fn run_folder(&self, folder: &FolderUri) -> SyncResult<FolderOutcome> {
        let start = self.store.get_playback_cursor(folder).await?;

        for (idx, kind) in PLAYBACK_ORDER.iter().enumerate().skip(start) {
            let ops = self.store.list_offline_ops(folder).await?;
            match self.process_kind(folder, *kind, &ops).await? {
                KindOutcome::Done => {
                    self.store.set_playback_cursor(folder, idx + 1).await?;
                }
                KindOutcome::Aborted => {
                    self.store.set_playback_cursor(folder, idx).await?;
                    return Ok(FolderOutcome::Aborted);
                }
                KindOutcome::ResyncNeeded => {
                    self.store.set_playback_cursor(folder, 0).await?;
                    return Ok(FolderOutcome::ResyncNeeded);
                }
            }
        }

        self.store.set_playback_cursor(folder, 0).await?;
        Ok(FolderOutcome::Completed)
    }

    async fn process_kind(&self, folder: &FolderUri, kind: OfflineOpKind, ops: &[OfflineOp]) -> SyncResult<KindOutcome> {
        for (key, group) in coalesce(ops, kind) {
            match self.dispatch_group(folder, kind, &key, &group).await? {
                DispatchOutcome::Success => {
                    for op in &group {
                        self.store.remove_offline_op(op.id).await?;
                    }
                }
                DispatchOutcome::TransientRetry => return Ok(KindOutcome::Aborted),
                // Non-COPY/MOVE failures do not retry; the record is cleared
                // as though it had completed. Lossy but safe — the next
                // SELECT reveals any drift.
                DispatchOutcome::NonRetryableFailure => {
                    for op in &group {
                        self.store.remove_offline_op(op.id).await?;
                    }
                }
            }
        }
        Ok(KindOutcome::Done)
    }

    async fn dispatch_group(
        &self,
        folder: &FolderUri,
        kind: OfflineOpKind,
        key: &CoalesceKey,
        group: &[&OfflineOp],
    ) -> SyncResult<DispatchOutcome> {
        if group.is_empty() {
            return Ok(DispatchOutcome::Success);
        }
        let uids: Vec<Uid> = group.iter().map(|op| op.message_key).collect();

        match kind {
            OfflineOpKind::FLAGS_CHANGED => {
                let mask = match key {
                    CoalesceKey::FlagMask(m) => *m,
                    _ => 0,
                };
                let rep = group[0];
                let add_mask = rep.new_flag_bits & mask;
                let remove_mask = mask & !rep.new_flag_bits;

                if add_mask != 0 {
                    let o = self.protocol.store_flags(folder, &uids, true, MessageFlags::from_bits(add_mask)).await;
                    if !o.exit_code.is_success() {
                        return Ok(classify(o.exit_code));
                    }
                }
                if remove_mask != 0 {
                    let o = self.protocol.store_flags(folder, &uids, false, MessageFlags::from_bits(remove_mask)).await;
                    if !o.exit_code.is_success() {
                        return Ok(classify(o.exit_code));
                    }
                }
                Ok(DispatchOutcome::Success)
            }
            OfflineOpKind::ADD_KEYWORDS => {
                if !self.protocol.supports_user_flags() {
                    return Ok(DispatchOutcome::Success);
                }
                let keywords = group[0].keywords_to_add.clone();
                let outcome = self.protocol.store_keywords(folder, &uids, true, &keywords).await;
                Ok(classify(outcome.exit_code))
            }
            OfflineOpKind::REMOVE_KEYWORDS => {
                if !self.protocol.supports_user_flags() {
                    return Ok(DispatchOutcome::Success);
                }
                let keywords = group[0].keywords_to_remove.clone();
                let outcome = self.protocol.store_keywords(folder, &uids, false, &keywords).await;
                Ok(classify(outcome.exit_code))
            }
            OfflineOpKind::MSG_COPY => self.dispatch_copy_or_move(folder, group, &uids, false).await,
            OfflineOpKind::MSG_MOVED => self.dispatch_copy_or_move(folder, group, &uids, true).await,
            OfflineOpKind::APPEND_DRAFT | OfflineOpKind::APPEND_TEMPLATE => self.dispatch_append(folder, group).await,
            OfflineOpKind::DELETE_ALL_MSGS => {
                let outcome = self.protocol.delete_all_messages(folder).await;
                Ok(classify(outcome.exit_code))
            }
            _ => Ok(DispatchOutcome::Success),
        }
    }

    async fn dispatch_copy_or_move(
        &self,
        source: &FolderUri,
        group: &[&OfflineOp],
        uids: &[Uid],
        is_move: bool,
    ) -> SyncResult<DispatchOutcome> {
        let Some(dest) = group[0].dest_folder.clone() else {
            return Ok(DispatchOutcome::NonRetryableFailure);
        };

        if same_server(source, &dest) {
            let outcome = self.protocol.copy_messages(source, uids, &dest, is_move).await;
            match outcome.exit_code {
                ExitCode::Success => {
                    let copy = outcome.value.unwrap_or_default();
                    for (src_uid, dest_uid) in &copy.dest_uids {
                        if let Some(op) = group.iter().find(|op| op.message_key == *src_uid).copied() {
                            if let Some(mid) = self.pending_pseudo_message_id(op).await {
                                self.rename_pseudo(&dest, &mid, *dest_uid).await?;
                            }
                        }
                    }
                    if is_move {
                        let mut flags = MessageFlags::default();
                        flags.deleted = true;
                        let _ = self.protocol.store_flags(source, uids, true, flags).await;
                    }
                    Ok(DispatchOutcome::Success)
                }
                ExitCode::TransientNetwork => Ok(DispatchOutcome::TransientRetry),
                _ => Ok(DispatchOutcome::NonRetryableFailure),
            }
        } else {
            // Cross-server: stream each message to the destination via
            // append, then (on success, for a move) delete from source. The
            // source message is left in place until the destination append
            // succeeds.
            for op in group {
                let Some(bytes) = self.store.load_message_bytes(source, op.message_key).await? else {
                    continue;
                };
                let outcome = self.protocol.append_message(&bytes, &dest).await;
                match outcome.exit_code {
                    ExitCode::Success => {
                        if let Some(dest_uid) = outcome.value.and_then(|v| v.dest_uid) {
                            if let Some(mid) = self.pending_pseudo_message_id(op).await {
                                self.rename_pseudo(&dest, &mid, dest_uid).await?;
                            }
                        }
                        if is_move {
                            let mut flags = MessageFlags::default();
                            flags.deleted = true;
                            let _ = self.protocol.store_flags(source, &[op.message_key], true, flags).await;
                        }
                    }
                    ExitCode::TransientNetwork => return Ok(DispatchOutcome::TransientRetry),
                    _ => continue,
                }
            }
            Ok(DispatchOutcome::Success)
        }
    }

    async fn dispatch_append(&self, dest: &FolderUri, group: &[&OfflineOp]) -> SyncResult<DispatchOutcome> {
        for op in group {
            let Some(bytes) = self.store.load_message_bytes(&op.source_folder, op.message_key).await? else {
                continue;
            };
            let outcome = self.protocol.append_message(&bytes, dest).await;
            match outcome.exit_code {
                ExitCode::Success => {
                    if let Some(dest_uid) = outcome.value.and_then(|v| v.dest_uid) {
                        if let Some(mid) = self.pending_pseudo_message_id(op).await {
                            self.rename_pseudo(dest, &mid, dest_uid).await?;
                        }
                    }
                }
                ExitCode::TransientNetwork => return Ok(DispatchOutcome::TransientRetry),
                _ => continue,
            }
        }
        Ok(DispatchOutcome::Success)
    }

    /// Looks up the message-id of the message this operation is moving or
    /// copying, read off its still-present header in the source folder.
    async fn pending_pseudo_message_id(&self, op: &OfflineOp) -> Option<String> {
        let header = self.store.get_header(&op.source_folder, op.message_key).await.ok().flatten()?;
        header.message_id
    }

    /// Pseudo-header rename protocol. An empty or missing message-id is
    /// always treated as no-match.
    async fn rename_pseudo(&self, dest: &FolderUri, message_id: &str, real_uid: Uid) -> SyncResult<()> {
        let Some(normalized) = normalize_message_id(message_id) else {
            return Ok(());
        };
        if let Some(fake_uid) = self.store.find_pseudo_by_message_id(dest, normalized).await? {
            info!(folder = %dest, from = fake_uid, to = real_uid, "renaming pseudo header to server uid");
            self.store.rename_key(dest, fake_uid, real_uid).await?;
        }
        Ok(())
    }
}

fn classify(exit_code: ExitCode) -> DispatchOutcome {
    match exit_code {
        ExitCode::Success => DispatchOutcome::Success,
        _ => DispatchOutcome::NonRetryableFailure,
    }
}

/// `true` if two folder URIs name the same IMAP host. URIs are shaped
/// `imap://host/path...`; only the host component is compared.
fn same_server(a: &FolderUri, b: &FolderUri) -> bool {
    host_of(&a.0) == host_of(&b.0)
}

fn host_of(uri: &str) -> &str {
    uri.split("://")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .unwrap_or(uri)
}
