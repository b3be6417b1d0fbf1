//! The `ProtocolEngine` boundary.
//!
//! The core never speaks IMAP itself. It hands a shaped request
//! to whatever implements `ProtocolEngine` and awaits a single
//! [`UrlOutcome`] — the async equivalent of "returns a URL handle; completion
//! arrives via `OnStopRunningUrl(url, exitCode)`".

use async_trait::async_trait;

use crate::types::{FolderUri, MessageFlags, Uid};

/// Exit code of a completed URL. `Success` is the only
/// non-error outcome; everything else maps onto a `SyncError` at the call
/// site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    TransientNetwork,
    ProtocolFailure,
    UserCancelled,
    Fatal,
}

impl ExitCode {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Success)
    }
}

/// A completed `ProtocolEngine` call: the exit code plus an optional typed
/// payload (e.g. the new server counts from a SELECT).
#[derive(Clone, Debug)]
pub struct UrlOutcome<T> {
    pub exit_code: ExitCode,
    pub value: Option<T>,
}

impl<T> UrlOutcome<T> {
    pub fn success(value: T) -> Self {
        UrlOutcome {
            exit_code: ExitCode::Success,
            value: Some(value),
        }
    }

    pub fn failed(exit_code: ExitCode) -> Self {
        UrlOutcome {
            exit_code,
            value: None,
        }
    }
}

/// Result of a SELECT:
/// UID-validity, current counts, and — if the server returned one — the
/// authoritative (possibly partial under CONDSTORE) flag state.
#[derive(Clone, Debug, Default)]
pub struct SelectOutcome {
    pub uid_validity: u32,
    pub uid_next: Option<u32>,
    pub total: i64,
    pub recent: i64,
    pub flag_state: Option<crate::types::FlagState>,
}

/// Result of a STATUS/NOOP.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatusOutcome {
    pub total: i64,
    pub recent: i64,
    pub unseen: i64,
    pub next_uid: i64,
}

/// Result of a COPY, carrying UIDPLUS destination UIDs when the server
/// supports it.
#[derive(Clone, Debug, Default)]
pub struct CopyOutcome {
    /// `(source_uid, dest_uid)` pairs, present only when UIDPLUS applies.
    pub dest_uids: Vec<(Uid, Uid)>,
}

/// Result of an APPEND, carrying the destination UID when UIDPLUS applies.
#[derive(Clone, Copy, Debug, Default)]
pub struct AppendOutcome {
    pub dest_uid: Option<Uid>,
}

/// A flag-bits mask used by STORE.
pub type FlagMask = MessageFlags;

/// A set of user-defined keywords used by STORE.
pub type KeywordSet = Vec<String>;

/// External collaborator that performs IMAP operations. The
/// core only asserts ordering; exact URL shapes are this trait's contract.
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    async fn select_folder(&self, folder: &FolderUri) -> UrlOutcome<SelectOutcome>;

    async fn update_folder_status(&self, folder: &FolderUri) -> UrlOutcome<StatusOutcome>;

    async fn fetch_message_bodies(&self, folder: &FolderUri, uids: &[Uid]) -> UrlOutcome<()>;

    async fn store_flags(
        &self,
        folder: &FolderUri,
        uids: &[Uid],
        add: bool,
        mask: FlagMask,
    ) -> UrlOutcome<()>;

    async fn store_keywords(
        &self,
        folder: &FolderUri,
        uids: &[Uid],
        add: bool,
        keywords: &KeywordSet,
    ) -> UrlOutcome<()>;

    async fn copy_messages(
        &self,
        source: &FolderUri,
        uids: &[Uid],
        dest: &FolderUri,
        is_move: bool,
    ) -> UrlOutcome<CopyOutcome>;

    async fn append_message(&self, bytes: &[u8], dest: &FolderUri) -> UrlOutcome<AppendOutcome>;

    async fn create_folder(&self, parent: &FolderUri, name: &str) -> UrlOutcome<()>;

    async fn delete_all_messages(&self, folder: &FolderUri) -> UrlOutcome<()>;

    /// `true` if the server advertises UIDPLUS for this connection. Needed
    /// for an efficient COPY-based rename that learns the destination UID
    /// from the COPYUID response code instead of a follow-up SELECT.
    fn supports_uidplus(&self) -> bool {
        false
    }

    /// `true` if the server supports user-defined (IMAP keyword) flags.
    fn supports_user_flags(&self) -> bool {
        true
    }
}
