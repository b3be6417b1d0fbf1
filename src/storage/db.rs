//! `SqliteStore`: the `MessageStore` boundary backed by sqlx/SQLite.
//!
//! A `SqlitePool` plus a `default_data_dir` helper, with migrations run as a
//! single `CREATE TABLE IF NOT EXISTS` block at startup. Schema covers
//! headers, bodies, offline operations, folder cache, and the playback
//! cursor.

use std::env;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dirs::home_dir;
use sqlx::{Row, Sqlite, SqlitePool};
use tracing::warn;

use crate::errors::{SyncError, SyncResult};
use crate::offline_op::{OfflineOp, OfflineOpId, OfflineOpKind};
use crate::store::MessageStore;
use crate::types::{FolderCacheElement, FolderUri, MessageFlags, MessageHeader, Uid};

const DB_FILE_NAME: &str = "autosync.db";

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteStore {
    pub async fn new_default() -> SyncResult<Self> {
        Self::new_named(DB_FILE_NAME).await
    }

    pub async fn new_named(file_name: &str) -> SyncResult<Self> {
        let base = default_data_dir()?;
        let db_path = base.join(file_name);
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::Fatal(format!("creating data directory {}: {e}", parent.display())))?;
        }

        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| SyncError::Fatal(format!("connecting to sqlite at {}: {e}", db_path.display())))?;

        let store = SqliteStore { pool, path: db_path };
        store.migrate().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> SyncResult<()> {
        sqlx::query("PRAGMA foreign_keys = ON;").execute(&self.pool).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS headers (
                folder_uri TEXT NOT NULL,
                uid INTEGER NOT NULL,
                size INTEGER NOT NULL,
                date INTEGER NOT NULL,
                flag_bits INTEGER NOT NULL,
                keywords TEXT NOT NULL,
                is_offline INTEGER NOT NULL,
                pending_removal INTEGER NOT NULL,
                message_id TEXT,
                server_thread TEXT,
                label TEXT,
                PRIMARY KEY (folder_uri, uid)
            );
            CREATE INDEX IF NOT EXISTS idx_headers_message_id ON headers(folder_uri, message_id);

            CREATE TABLE IF NOT EXISTS message_bodies (
                folder_uri TEXT NOT NULL,
                uid INTEGER NOT NULL,
                bytes BLOB NOT NULL,
                PRIMARY KEY (folder_uri, uid)
            );

            CREATE TABLE IF NOT EXISTS offline_ops (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_folder TEXT NOT NULL,
                message_key INTEGER NOT NULL,
                kind INTEGER NOT NULL,
                dest_folder TEXT,
                new_flag_bits INTEGER NOT NULL,
                new_flag_mask INTEGER NOT NULL,
                keywords_to_add TEXT NOT NULL,
                keywords_to_remove TEXT NOT NULL,
                message_size INTEGER NOT NULL,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_offline_ops_folder ON offline_ops(source_folder);

            CREATE TABLE IF NOT EXISTS folder_cache (
                folder_uri TEXT PRIMARY KEY,
                box_flags INTEGER NOT NULL,
                hier_delim TEXT NOT NULL,
                online_name TEXT NOT NULL,
                acl_flags INTEGER NOT NULL,
                server_total INTEGER NOT NULL,
                server_unseen INTEGER NOT NULL,
                server_recent INTEGER NOT NULL,
                next_uid INTEGER NOT NULL,
                last_sync_time_in_sec INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS playback_cursor (
                folder_uri TEXT PRIMARY KEY,
                pos INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS fake_uid_counter (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                next_value INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO fake_uid_counter (id, next_value) VALUES (1, ?1);")
            .bind(crate::types::FAKE_UID_BASE as i64)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn row_to_header(row: &sqlx::sqlite::SqliteRow, folder: &FolderUri) -> SyncResult<MessageHeader> {
    let keywords: String = row.get("keywords");
    let keywords: Vec<String> = serde_json::from_str(&keywords).unwrap_or_default();
    let date_ts: i64 = row.get("date");
    let date: DateTime<Utc> = Utc.timestamp_opt(date_ts, 0).single().unwrap_or_else(Utc::now);

    Ok(MessageHeader {
        uid: row.get::<i64, _>("uid") as Uid,
        folder: folder.clone(),
        size: row.get::<i64, _>("size") as u64,
        date,
        flags: MessageFlags::from_bits(row.get::<i64, _>("flag_bits") as u32),
        keywords,
        is_offline: row.get::<i64, _>("is_offline") != 0,
        pending_removal: row.get::<i64, _>("pending_removal") != 0,
        message_id: row.get("message_id"),
        server_thread: row.get("server_thread"),
        label: row.get("label"),
    })
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn list_all_keys(&self, folder: &FolderUri) -> SyncResult<Vec<Uid>> {
        let rows = sqlx::query("SELECT uid FROM headers WHERE folder_uri = ?1 ORDER BY uid ASC;")
            .bind(&folder.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get::<i64, _>("uid") as Uid).collect())
    }

    async fn get_header(&self, folder: &FolderUri, uid: Uid) -> SyncResult<Option<MessageHeader>> {
        let row = sqlx::query("SELECT * FROM headers WHERE folder_uri = ?1 AND uid = ?2;")
            .bind(&folder.0)
            .bind(uid as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_header(&r, folder)).transpose()
    }

    async fn contains_key(&self, folder: &FolderUri, uid: Uid) -> SyncResult<bool> {
        let row = sqlx::query("SELECT 1 FROM headers WHERE folder_uri = ?1 AND uid = ?2;")
            .bind(&folder.0)
            .bind(uid as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn put_header(&self, header: MessageHeader) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO headers (
                folder_uri, uid, size, date, flag_bits, keywords,
                is_offline, pending_removal, message_id, server_thread, label
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(folder_uri, uid) DO UPDATE SET
                size = excluded.size,
                date = excluded.date,
                flag_bits = excluded.flag_bits,
                keywords = excluded.keywords,
                is_offline = excluded.is_offline,
                pending_removal = excluded.pending_removal,
                message_id = excluded.message_id,
                server_thread = excluded.server_thread,
                label = excluded.label;
            "#,
        )
        .bind(&header.folder.0)
        .bind(header.uid as i64)
        .bind(header.size as i64)
        .bind(header.date.timestamp())
        .bind(header.flags.to_bits() as i64)
        .bind(serde_json::to_string(&header.keywords).unwrap_or_else(|_| "[]".into()))
        .bind(header.is_offline as i64)
        .bind(header.pending_removal as i64)
        .bind(&header.message_id)
        .bind(&header.server_thread)
        .bind(&header.label)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_header(&self, folder: &FolderUri, uid: Uid) -> SyncResult<()> {
        sqlx::query("DELETE FROM headers WHERE folder_uri = ?1 AND uid = ?2;")
            .bind(&folder.0)
            .bind(uid as i64)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM message_bodies WHERE folder_uri = ?1 AND uid = ?2;")
            .bind(&folder.0)
            .bind(uid as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_message_bytes(&self, folder: &FolderUri, uid: Uid) -> SyncResult<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT bytes FROM message_bodies WHERE folder_uri = ?1 AND uid = ?2;")
            .bind(&folder.0)
            .bind(uid as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>("bytes")))
    }

    async fn store_message_bytes(&self, folder: &FolderUri, uid: Uid, bytes: &[u8]) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO message_bodies (folder_uri, uid, bytes) VALUES (?1, ?2, ?3)
            ON CONFLICT(folder_uri, uid) DO UPDATE SET bytes = excluded.bytes;
            "#,
        )
        .bind(&folder.0)
        .bind(uid as i64)
        .bind(bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn rename_key(&self, folder: &FolderUri, old_uid: Uid, new_uid: Uid) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE headers SET uid = ?1 WHERE folder_uri = ?2 AND uid = ?3;")
            .bind(new_uid as i64)
            .bind(&folder.0)
            .bind(old_uid as i64)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE message_bodies SET uid = ?1 WHERE folder_uri = ?2 AND uid = ?3;")
            .bind(new_uid as i64)
            .bind(&folder.0)
            .bind(old_uid as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn reset_folder(&self, folder: &FolderUri) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM headers WHERE folder_uri = ?1;")
            .bind(&folder.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM message_bodies WHERE folder_uri = ?1;")
            .bind(&folder.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM offline_ops WHERE source_folder = ?1;")
            .bind(&folder.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_offline_op_for_key(
        &self,
        folder: &FolderUri,
        uid: Uid,
        create_if_missing: bool,
    ) -> SyncResult<Option<OfflineOp>> {
        let row = sqlx::query("SELECT * FROM offline_ops WHERE source_folder = ?1 AND message_key = ?2 LIMIT 1;")
            .bind(&folder.0)
            .bind(uid as i64)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = row {
            return Ok(Some(row_to_offline_op(&row)));
        }
        if !create_if_missing {
            return Ok(None);
        }
        Ok(Some(OfflineOp::new(folder.clone(), uid, crate::types::now_ts())))
    }

    async fn put_offline_op(&self, op: OfflineOp) -> SyncResult<OfflineOpId> {
        let id = sqlx::query(
            r#"
            INSERT INTO offline_ops (
                id, source_folder, message_key, kind, dest_folder,
                new_flag_bits, new_flag_mask, keywords_to_add, keywords_to_remove,
                message_size, timestamp
            )
            VALUES (CASE WHEN ?1 = 0 THEN NULL ELSE ?1 END, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                dest_folder = excluded.dest_folder,
                new_flag_bits = excluded.new_flag_bits,
                new_flag_mask = excluded.new_flag_mask,
                keywords_to_add = excluded.keywords_to_add,
                keywords_to_remove = excluded.keywords_to_remove,
                message_size = excluded.message_size,
                timestamp = excluded.timestamp
            RETURNING id;
            "#,
        )
        .bind(op.id)
        .bind(&op.source_folder.0)
        .bind(op.message_key as i64)
        .bind(op.kind.bits() as i64)
        .bind(op.dest_folder.as_ref().map(|f| f.0.clone()))
        .bind(op.new_flag_bits as i64)
        .bind(op.new_flag_mask as i64)
        .bind(serde_json::to_string(&op.keywords_to_add).unwrap_or_else(|_| "[]".into()))
        .bind(serde_json::to_string(&op.keywords_to_remove).unwrap_or_else(|_| "[]".into()))
        .bind(op.message_size as i64)
        .bind(op.timestamp)
        .fetch_one(&self.pool)
        .await?
        .get::<i64, _>("id");
        Ok(id)
    }

    async fn remove_offline_op(&self, op_id: OfflineOpId) -> SyncResult<()> {
        sqlx::query("DELETE FROM offline_ops WHERE id = ?1;")
            .bind(op_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_offline_ops(&self, folder: &FolderUri) -> SyncResult<Vec<OfflineOp>> {
        let rows = sqlx::query("SELECT * FROM offline_ops WHERE source_folder = ?1 ORDER BY id ASC;")
            .bind(&folder.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_offline_op).collect())
    }

    async fn drop_offline_ops_for_folder(&self, folder: &FolderUri) -> SyncResult<()> {
        sqlx::query("DELETE FROM offline_ops WHERE source_folder = ?1;")
            .bind(&folder.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn next_fake_offline_msg_key(&self) -> SyncResult<Uid> {
        let mut tx = self.pool.begin().await?;
        let current: i64 = sqlx::query("SELECT next_value FROM fake_uid_counter WHERE id = 1;")
            .fetch_one(&mut *tx)
            .await?
            .get("next_value");
        sqlx::query("UPDATE fake_uid_counter SET next_value = next_value + 1 WHERE id = 1;")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(current as Uid)
    }

    async fn get_playback_cursor(&self, folder: &FolderUri) -> SyncResult<usize> {
        let row = sqlx::query("SELECT pos FROM playback_cursor WHERE folder_uri = ?1;")
            .bind(&folder.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("pos") as usize).unwrap_or(0))
    }

    async fn set_playback_cursor(&self, folder: &FolderUri, pos: usize) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO playback_cursor (folder_uri, pos) VALUES (?1, ?2)
            ON CONFLICT(folder_uri) DO UPDATE SET pos = excluded.pos;
            "#,
        )
        .bind(&folder.0)
        .bind(pos as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_folder_cache(&self, folder: &FolderUri) -> SyncResult<FolderCacheElement> {
        let row = sqlx::query("SELECT * FROM folder_cache WHERE folder_uri = ?1;")
            .bind(&folder.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(r) => FolderCacheElement {
                box_flags: r.get::<i64, _>("box_flags") as u32,
                hier_delim: r
                    .get::<String, _>("hier_delim")
                    .chars()
                    .next()
                    .unwrap_or('/'),
                online_name: r.get("online_name"),
                acl_flags: r.get::<i64, _>("acl_flags") as u32,
                server_total: r.get("server_total"),
                server_unseen: r.get("server_unseen"),
                server_recent: r.get("server_recent"),
                next_uid: r.get("next_uid"),
                last_sync_time_in_sec: r.get("last_sync_time_in_sec"),
            },
            None => FolderCacheElement::default(),
        })
    }

    async fn set_folder_cache(&self, folder: &FolderUri, cache: FolderCacheElement) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO folder_cache (
                folder_uri, box_flags, hier_delim, online_name, acl_flags,
                server_total, server_unseen, server_recent, next_uid, last_sync_time_in_sec
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(folder_uri) DO UPDATE SET
                box_flags = excluded.box_flags,
                hier_delim = excluded.hier_delim,
                online_name = excluded.online_name,
                acl_flags = excluded.acl_flags,
                server_total = excluded.server_total,
                server_unseen = excluded.server_unseen,
                server_recent = excluded.server_recent,
                next_uid = excluded.next_uid,
                last_sync_time_in_sec = excluded.last_sync_time_in_sec;
            "#,
        )
        .bind(&folder.0)
        .bind(cache.box_flags as i64)
        .bind(cache.hier_delim.to_string())
        .bind(cache.online_name)
        .bind(cache.acl_flags as i64)
        .bind(cache.server_total)
        .bind(cache.server_unseen)
        .bind(cache.server_recent)
        .bind(cache.next_uid)
        .bind(cache.last_sync_time_in_sec)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_pseudo_by_message_id(&self, folder: &FolderUri, message_id: &str) -> SyncResult<Option<Uid>> {
        let row = sqlx::query(
            r#"
            SELECT uid FROM headers
            WHERE folder_uri = ?1 AND message_id = ?2 AND uid >= ?3
            LIMIT 1;
            "#,
        )
        .bind(&folder.0)
        .bind(message_id)
        .bind(crate::types::FAKE_UID_BASE as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<i64, _>("uid") as Uid))
    }
}

fn row_to_offline_op(row: &sqlx::sqlite::SqliteRow) -> OfflineOp {
    let kw_add: String = row.get("keywords_to_add");
    let kw_remove: String = row.get("keywords_to_remove");
    OfflineOp {
        id: row.get("id"),
        source_folder: FolderUri(row.get("source_folder")),
        message_key: row.get::<i64, _>("message_key") as Uid,
        kind: OfflineOpKind::from_bits_truncate(row.get::<i64, _>("kind") as u32),
        dest_folder: row.get::<Option<String>, _>("dest_folder").map(FolderUri),
        new_flag_bits: row.get::<i64, _>("new_flag_bits") as u32,
        new_flag_mask: row.get::<i64, _>("new_flag_mask") as u32,
        keywords_to_add: serde_json::from_str(&kw_add).unwrap_or_default(),
        keywords_to_remove: serde_json::from_str(&kw_remove).unwrap_or_default(),
        message_size: row.get::<i64, _>("message_size") as u64,
        timestamp: row.get("timestamp"),
    }
}

fn default_data_dir() -> SyncResult<PathBuf> {
    if let Ok(custom) = env::var("AUTOSYNC_DATA_DIR") {
        let path = PathBuf::from(custom);
        std::fs::create_dir_all(&path)
            .map_err(|e| SyncError::Fatal(format!("creating AUTOSYNC_DATA_DIR: {e}")))?;
        return Ok(path);
    }

    if let Some(home) = home_dir() {
        let path = home.join(".autosync");
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        }
        warn!("unable to create {}/.autosync; falling back to workspace-local storage", home.display());
    }

    let cwd = env::current_dir().map_err(|e| SyncError::Fatal(format!("determining current directory: {e}")))?;
    let path = cwd.join("autosync-data");
    std::fs::create_dir_all(&path).map_err(|e| SyncError::Fatal(format!("creating fallback data directory: {e}")))?;
    Ok(path)
}
