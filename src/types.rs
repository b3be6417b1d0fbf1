//! Core data model: message/folder identity and the message header record.
//!
//! UIDs, fake UIDs, folder flags and the header record are kept deliberately
//! small and `Copy`/`Clone`-friendly so the sync engine can pass them around
//! without borrowing the store.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A server-assigned UID, unique and monotonic within a folder's current
/// UID-validity epoch.
pub type Uid = u32;

/// Reserved space for locally-created "pseudo" messages that have not yet
/// been appended to the server. Chosen so it can never collide with a real
/// server UID a well-behaved server will assign.
pub const FAKE_UID_BASE: Uid = 0xF000_0000;

/// Returns true if `uid` falls in the reserved fake-UID range assigned to
/// locally-created messages that have no server UID yet.
pub fn is_fake_uid(uid: Uid) -> bool {
    uid >= FAKE_UID_BASE
}

macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(const $variant:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        pub struct $name($ty);

        impl $name {
            $(pub const $variant: $name = $name($value);)*

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn bits(&self) -> $ty {
                self.0
            }

            pub const fn from_bits_truncate(bits: $ty) -> Self {
                Self(bits)
            }

            pub const fn contains(&self, other: Self) -> bool {
                (self.0 & other.0) == other.0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

bitflags_like! {
    /// Folder role bits.
    pub struct FolderFlags: u32 {
        const INBOX = 1 << 0;
        const DRAFTS = 1 << 1;
        const SENT = 1 << 2;
        const TRASH = 1 << 3;
        const JUNK = 1 << 4;
        const ARCHIVE = 1 << 5;
        const VIRTUAL = 1 << 6;
        const OFFLINE_ENABLED = 1 << 7;
        const HAS_OFFLINE_EVENTS = 1 << 8;
        const NO_SELECT = 1 << 9;
        const CREATED_OFFLINE = 1 << 10;
        const CHECK_NEW = 1 << 11;
    }
}

/// Stable local identifier for a folder (not the server's name, which can
/// contain a hierarchy delimiter and is subject to rename).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FolderUri(pub String);

impl fmt::Display for FolderUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FolderUri {
    fn from(s: &str) -> Self {
        FolderUri(s.to_string())
    }
}

impl From<String> for FolderUri {
    fn from(s: String) -> Self {
        FolderUri(s)
    }
}

/// Folder identity: local URI, server name + hierarchy delimiter, and the
/// UID-validity/UIDNEXT pair that anchor the local replica to a server epoch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderIdentity {
    pub uri: FolderUri,
    pub server_name: String,
    pub hierarchy_delimiter: char,
    pub uid_validity: u32,
    pub uid_next: Option<u32>,
    pub flags: u32,
}

impl FolderIdentity {
    pub fn folder_flags(&self) -> FolderFlags {
        FolderFlags::from_bits_truncate(self.flags)
    }
}

/// Per-message flag bits that live in `MessageHeader`. Distinct from
/// `FolderFlags`; kept as plain bools on the header record rather than a
/// bitset since each flag has independent IMAP STORE semantics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFlags {
    pub read: bool,
    pub replied: bool,
    pub flagged: bool,
    pub forwarded: bool,
    pub deleted: bool,
    pub mdn_sent: bool,
}

/// A persisted message header record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageHeader {
    pub uid: Uid,
    pub folder: FolderUri,
    pub size: u64,
    pub date: DateTime<Utc>,
    pub flags: MessageFlags,
    pub keywords: Vec<String>,
    pub is_offline: bool,
    pub pending_removal: bool,
    pub message_id: Option<String>,
    pub server_thread: Option<String>,
    pub label: Option<String>,
}

impl MessageHeader {
    pub fn is_pseudo(&self) -> bool {
        is_fake_uid(self.uid)
    }
}

impl MessageFlags {
    const READ: u32 = 1 << 0;
    const REPLIED: u32 = 1 << 1;
    const FLAGGED: u32 = 1 << 2;
    const FORWARDED: u32 = 1 << 3;
    const DELETED: u32 = 1 << 4;
    const MDN_SENT: u32 = 1 << 5;

    /// Packs the six flag bits into a `u32` mask, for STORE calls and
    /// offline-operation records that carry a bitmask rather than a struct.
    pub fn to_bits(self) -> u32 {
        let mut bits = 0;
        if self.read {
            bits |= Self::READ;
        }
        if self.replied {
            bits |= Self::REPLIED;
        }
        if self.flagged {
            bits |= Self::FLAGGED;
        }
        if self.forwarded {
            bits |= Self::FORWARDED;
        }
        if self.deleted {
            bits |= Self::DELETED;
        }
        if self.mdn_sent {
            bits |= Self::MDN_SENT;
        }
        bits
    }

    pub fn from_bits(bits: u32) -> Self {
        MessageFlags {
            read: bits & Self::READ != 0,
            replied: bits & Self::REPLIED != 0,
            flagged: bits & Self::FLAGGED != 0,
            forwarded: bits & Self::FORWARDED != 0,
            deleted: bits & Self::DELETED != 0,
            mdn_sent: bits & Self::MDN_SENT != 0,
        }
    }

    /// Applies `mask` bits from `bits`, leaving the rest unchanged (used for
    /// STORE's add/subtract-by-mask semantics).
    pub fn apply_masked(self, bits: u32, mask: u32) -> Self {
        let current = self.to_bits();
        let updated = (current & !mask) | (bits & mask);
        Self::from_bits(updated)
    }
}

/// Server-side authoritative per-UID flag state returned by SELECT, possibly
/// partial under CONDSTORE.
#[derive(Clone, Debug, Default)]
pub struct FlagState {
    pub entries: Vec<(Uid, MessageFlags, bool /* server_deleted */)>,
    /// `true` if this is a CONDSTORE partial update (subset only); `false`
    /// means the server returned the full flag state for the mailbox.
    pub partial: bool,
}

/// Snapshot of the server-reported mailbox counts, taken after a
/// SELECT/STATUS completes. Used to decide whether an update URL is needed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServerCounts {
    pub total: i64,
    pub recent: i64,
    pub next_uid: i64,
}

/// The folder cache element persisted by the core: UIDVALIDITY/UIDNEXT and
/// the other per-folder fields a STATUS or SELECT response refreshes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FolderCacheElement {
    pub box_flags: u32,
    pub hier_delim: char,
    pub online_name: String,
    pub acl_flags: u32,
    pub server_total: i64,
    pub server_unseen: i64,
    pub server_recent: i64,
    pub next_uid: i64,
    pub last_sync_time_in_sec: i64,
}

impl Default for FolderIdentity {
    fn default() -> Self {
        FolderIdentity {
            uri: FolderUri(String::new()),
            server_name: String::new(),
            hierarchy_delimiter: '/',
            uid_validity: 0,
            uid_next: None,
            flags: 0,
        }
    }
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_uid_range_never_overlaps_real_uids() {
        assert!(!is_fake_uid(1));
        assert!(!is_fake_uid(u32::MAX / 2));
        assert!(is_fake_uid(FAKE_UID_BASE));
        assert!(is_fake_uid(FAKE_UID_BASE + 1));
    }

    #[test]
    fn folder_flags_compose() {
        let f = FolderFlags::INBOX | FolderFlags::OFFLINE_ENABLED;
        assert!(f.contains(FolderFlags::INBOX));
        assert!(f.contains(FolderFlags::OFFLINE_ENABLED));
        assert!(!f.contains(FolderFlags::TRASH));
    }

    #[test]
    fn message_flags_bit_round_trip() {
        let f = MessageFlags {
            read: true,
            replied: false,
            flagged: true,
            forwarded: false,
            deleted: false,
            mdn_sent: false,
        };
        assert_eq!(MessageFlags::from_bits(f.to_bits()), f);
    }

    #[test]
    fn apply_masked_only_touches_masked_bits() {
        let f = MessageFlags::default();
        let masked = f.apply_masked(MessageFlags::DELETED, MessageFlags::DELETED);
        assert!(masked.deleted);
        assert!(!masked.read);
    }
}
