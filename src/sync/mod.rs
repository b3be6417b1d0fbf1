//! Sync engine: folder state machine, queues, orchestration, offline playback.

pub mod folder_state;
pub mod manager;
pub mod playback;
pub mod queues;

pub use folder_state::{FolderSyncState, SyncState};
pub use manager::{IdleState, SyncEvent, SyncManager};
pub use playback::{OfflinePlayback, PlaybackFolderInfo, PlaybackReport};
pub use queues::{DedupQueue, PriorityQueue, QueueKind};
