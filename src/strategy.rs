//! Folder and message priority strategies.
//!
//! Both are modeled as a tagged `Strategy` variant rather than a trait
//! object hierarchy: the default rules are plain functions, and a caller
//! that wants different behavior supplies a comparator + exclusion
//! predicate instead of implementing an interface.

use std::cmp::Ordering as StdOrdering;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::types::{FolderFlags, FolderIdentity, MessageHeader};

/// Total-preorder comparison result for folder priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    Lower,
    Same,
    Higher,
}

/// Canonical folder type used for the `Inbox > Drafts > generic > Trash`
/// ordering rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum FolderRank {
    Inbox = 0,
    Drafts = 1,
    Generic = 2,
    Trash = 3,
}

fn folder_rank(flags: FolderFlags) -> FolderRank {
    if flags.contains(FolderFlags::INBOX) {
        FolderRank::Inbox
    } else if flags.contains(FolderFlags::DRAFTS) {
        FolderRank::Drafts
    } else if flags.contains(FolderFlags::TRASH) {
        FolderRank::Trash
    } else {
        FolderRank::Generic
    }
}

/// `true` if the folder is excluded from any queue at all: virtual folders
/// and folders with no parent never participate in sync.
pub fn folder_excluded(identity: &FolderIdentity, has_parent: bool) -> bool {
    identity.folder_flags().contains(FolderFlags::VIRTUAL) || !has_parent
}

/// Default folder-priority comparison. `a_open`
/// and `b_open` report whether each folder is currently open in the UI.
pub fn default_folder_priority(
    a: &FolderIdentity,
    a_open: bool,
    b: &FolderIdentity,
    b_open: bool,
) -> Priority {
    if a_open != b_open {
        return if a_open { Priority::Higher } else { Priority::Lower };
    }
    let ra = folder_rank(a.folder_flags());
    let rb = folder_rank(b.folder_flags());
    match ra.cmp(&rb) {
        StdOrdering::Less => Priority::Higher,
        StdOrdering::Greater => Priority::Lower,
        StdOrdering::Equal => Priority::Same,
    }
}

/// A folder-priority strategy: an exclusion predicate plus a total-preorder
/// comparator. `Default` encodes the built-in ordering rules exactly;
/// `Custom` lets a caller install another implementation.
#[derive(Clone)]
pub enum FolderStrategy {
    Default,
    Custom(Arc<dyn Fn(&FolderIdentity, bool, &FolderIdentity, bool) -> Priority + Send + Sync>),
}

impl FolderStrategy {
    pub fn compare(
        &self,
        a: &FolderIdentity,
        a_open: bool,
        b: &FolderIdentity,
        b_open: bool,
    ) -> Priority {
        match self {
            FolderStrategy::Default => default_folder_priority(a, a_open, b, b_open),
            FolderStrategy::Custom(f) => f(a, a_open, b, b_open),
        }
    }
}

impl Default for FolderStrategy {
    fn default() -> Self {
        FolderStrategy::Default
    }
}

/// `true` if `header` is excluded from the download queue on age grounds.
/// `offline_age_days_max <= 0` disables the filter.
pub fn message_age_excluded(
    header: &MessageHeader,
    offline_age_days_max: i64,
    now: DateTime<Utc>,
) -> bool {
    if offline_age_days_max <= 0 {
        return false;
    }
    let age = now.signed_duration_since(header.date);
    age.num_days() > offline_age_days_max
}

/// Default per-folder message ordering: large
/// messages sink to the bottom; among non-large messages, newer-first then
/// smaller-first.
pub fn default_message_order(
    a: &MessageHeader,
    b: &MessageHeader,
    first_pass_size: u64,
) -> StdOrdering {
    let a_large = a.size > first_pass_size;
    let b_large = b.size > first_pass_size;
    if a_large != b_large {
        return if a_large {
            StdOrdering::Greater
        } else {
            StdOrdering::Less
        };
    }
    // newer first: larger date sorts earlier
    match b.date.cmp(&a.date) {
        StdOrdering::Equal => a.size.cmp(&b.size),
        other => other,
    }
}

/// A message-priority strategy: an exclusion predicate plus an ordering.
#[derive(Clone)]
pub enum MessageStrategy {
    Default,
    Custom(Arc<dyn Fn(&MessageHeader, &MessageHeader, u64) -> StdOrdering + Send + Sync>),
}

impl MessageStrategy {
    pub fn compare(&self, a: &MessageHeader, b: &MessageHeader, first_pass_size: u64) -> StdOrdering {
        match self {
            MessageStrategy::Default => default_message_order(a, b, first_pass_size),
            MessageStrategy::Custom(f) => f(a, b, first_pass_size),
        }
    }

    pub fn excluded(&self, header: &MessageHeader, offline_age_days_max: i64, now: DateTime<Utc>) -> bool {
        message_age_excluded(header, offline_age_days_max, now)
    }
}

impl Default for MessageStrategy {
    fn default() -> Self {
        MessageStrategy::Default
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FolderUri, MessageFlags};
    use chrono::Duration;

    fn folder(flags: FolderFlags) -> FolderIdentity {
        FolderIdentity {
            uri: FolderUri::from("imap://a/f"),
            server_name: "f".into(),
            hierarchy_delimiter: '/',
            uid_validity: 1,
            uid_next: None,
            flags: flags.bits(),
        }
    }

    #[test]
    fn inbox_outranks_generic() {
        let inbox = folder(FolderFlags::INBOX);
        let generic = folder(FolderFlags::empty());
        assert_eq!(
            default_folder_priority(&inbox, false, &generic, false),
            Priority::Higher
        );
    }

    #[test]
    fn open_folder_outranks_closed_regardless_of_type() {
        let trash = folder(FolderFlags::TRASH);
        let inbox = folder(FolderFlags::INBOX);
        assert_eq!(
            default_folder_priority(&trash, true, &inbox, false),
            Priority::Higher
        );
    }

    #[test]
    fn virtual_and_orphan_are_excluded() {
        let v = folder(FolderFlags::VIRTUAL);
        assert!(folder_excluded(&v, true));
        let orphan = folder(FolderFlags::empty());
        assert!(folder_excluded(&orphan, false));
        let normal = folder(FolderFlags::empty());
        assert!(!folder_excluded(&normal, true));
    }

    fn header(date: DateTime<Utc>, size: u64) -> MessageHeader {
        MessageHeader {
            uid: 1,
            folder: FolderUri::from("imap://a/f"),
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

    #[test]
    fn large_messages_sink_to_bottom() {
        let now = Utc::now();
        let small = header(now, 1024);
        let large = header(now, 1024 * 1024);
        assert_eq!(
            default_message_order(&small, &large, 300 * 1024),
            StdOrdering::Less
        );
    }

    #[test]
    fn newer_first_then_smaller_first() {
        let now = Utc::now();
        let newer = header(now, 100);
        let older = header(now - Duration::days(1), 100);
        assert_eq!(default_message_order(&newer, &older, 300 * 1024), StdOrdering::Less);

        let small = header(now, 10);
        let big = header(now, 100);
        assert_eq!(default_message_order(&small, &big, 300 * 1024), StdOrdering::Less);
    }

    #[test]
    fn age_exclusion_respects_disable_value() {
        let now = Utc::now();
        let old = header(now - Duration::days(40), 10);
        assert!(!message_age_excluded(&old, 0, now));
        assert!(message_age_excluded(&old, 30, now));
        assert!(!message_age_excluded(&old, 60, now));
    }
}
