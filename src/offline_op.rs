//! Offline operation records.
//!
//! One mutable record per message key carries an operation-type bitset,
//! since a single key can accumulate several pending actions (e.g. a flag
//! change plus a move) before the next playback. The bitset
//! (`OfflineOpKind`) lives on a shared header, with payload fields that are
//! simply `None`/empty when unused.

use serde::{Deserialize, Serialize};

use crate::types::{FolderUri, Uid};

macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(const $variant:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
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

            pub fn is_empty(&self) -> bool {
                self.0 == 0
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
    /// Operation-type bitset. One record may accumulate several
    /// of these before playback coalesces and dispatches them.
    pub struct OfflineOpKind: u32 {
        const FLAGS_CHANGED   = 1 << 0;
        const ADD_KEYWORDS    = 1 << 1;
        const REMOVE_KEYWORDS = 1 << 2;
        const MSG_COPY        = 1 << 3;
        const MSG_MOVED       = 1 << 4;
        const APPEND_DRAFT    = 1 << 5;
        const APPEND_TEMPLATE = 1 << 6;
        const DELETE_ALL_MSGS = 1 << 7;
        const MOVE_RESULT     = 1 << 8;
        const ADDED_HEADER    = 1 << 9;
        const DELETED_MSG     = 1 << 10;
        const MSG_MARKED_DELETED = 1 << 11;
    }
}

/// Playback runs these in a fixed total order per folder.
/// `MoveResult`/`AddedHeader`/`DeletedMsg` are markers, not independently
/// played back, so they are excluded here.
pub const PLAYBACK_ORDER: &[OfflineOpKind] = &[
    OfflineOpKind::FLAGS_CHANGED,
    OfflineOpKind::ADD_KEYWORDS,
    OfflineOpKind::REMOVE_KEYWORDS,
    OfflineOpKind::MSG_COPY,
    OfflineOpKind::MSG_MOVED,
    OfflineOpKind::APPEND_DRAFT,
    OfflineOpKind::APPEND_TEMPLATE,
    OfflineOpKind::DELETE_ALL_MSGS,
];

pub type OfflineOpId = i64;

/// A persisted record attached to a message key (or a synthetic key for
/// folder-level operations like `DeleteAllMsgs`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OfflineOp {
    pub id: OfflineOpId,
    pub source_folder: FolderUri,
    pub message_key: Uid,
    pub kind: OfflineOpKind,
    pub dest_folder: Option<FolderUri>,
    pub new_flag_bits: u32,
    pub new_flag_mask: u32,
    pub keywords_to_add: Vec<String>,
    pub keywords_to_remove: Vec<String>,
    pub message_size: u64,
    pub timestamp: i64,
}

impl OfflineOp {
    pub fn new(source_folder: FolderUri, message_key: Uid, timestamp: i64) -> Self {
        OfflineOp {
            id: 0,
            source_folder,
            message_key,
            kind: OfflineOpKind::empty(),
            dest_folder: None,
            new_flag_bits: 0,
            new_flag_mask: 0,
            keywords_to_add: Vec::new(),
            keywords_to_remove: Vec::new(),
            message_size: 0,
            timestamp,
        }
    }

    /// Two records "share the same parameters" for coalescing purposes
    /// when their operation-relevant fields match: same flag
    /// mask, same keyword set, same destination folder.
    pub fn coalesce_key(&self, kind: OfflineOpKind) -> CoalesceKey {
        match kind {
            OfflineOpKind::FLAGS_CHANGED => CoalesceKey::FlagMask(self.new_flag_mask),
            OfflineOpKind::ADD_KEYWORDS => {
                let mut kws = self.keywords_to_add.clone();
                kws.sort();
                CoalesceKey::Keywords(kws)
            }
            OfflineOpKind::REMOVE_KEYWORDS => {
                let mut kws = self.keywords_to_remove.clone();
                kws.sort();
                CoalesceKey::Keywords(kws)
            }
            OfflineOpKind::MSG_COPY | OfflineOpKind::MSG_MOVED => {
                CoalesceKey::Dest(self.dest_folder.clone())
            }
            _ => CoalesceKey::None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CoalesceKey {
    FlagMask(u32),
    Keywords(Vec<String>),
    Dest(Option<FolderUri>),
    None,
}

/// Groups consecutive records sharing a coalesce key for a given kind into
/// batches, preserving encounter order.
pub fn coalesce<'a>(
    ops: &'a [OfflineOp],
    kind: OfflineOpKind,
) -> Vec<(CoalesceKey, Vec<&'a OfflineOp>)> {
    let mut groups: Vec<(CoalesceKey, Vec<&OfflineOp>)> = Vec::new();
    for op in ops.iter().filter(|o| o.kind.contains(kind)) {
        let key = op.coalesce_key(kind);
        if let Some(last) = groups.last_mut() {
            if last.0 == key {
                last.1.push(op);
                continue;
            }
        }
        groups.push((key, vec![op]));
    }
    groups
}
