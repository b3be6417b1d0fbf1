//! `ProtocolEngine` implementation over a single persistent `async-imap`
//! session, reusing the TLS connection setup `imap::mod` already had
//! (rustls + native root certs) but authenticating with a plain
//! username/password LOGIN instead of XOAUTH2.

use std::sync::Arc;

use async_imap::types::{Fetch, Flag};
use async_imap::Session;
use async_trait::async_trait;
use futures::TryStreamExt;
use rustls_native_certs::load_native_certs;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, warn};

use crate::errors::{SyncError, SyncResult};
use crate::protocol::{
    AppendOutcome, CopyOutcome, ExitCode, FlagMask, KeywordSet, ProtocolEngine, SelectOutcome,
    StatusOutcome, UrlOutcome,
};
use crate::store::MessageStore;
use crate::types::{FlagState, FolderUri, MessageFlags, MessageHeader, Uid};

type ImapStream = Compat<tokio_rustls::client::TlsStream<TcpStream>>;
type ImapSession = Session<ImapStream>;

/// Server endpoint and credentials for a single mailbox account. `dest` in
/// `ProtocolEngine` calls is always treated as an IMAP mailbox name directly
/// (no local/server name translation layer — callers pass server-side
/// mailbox names as `FolderUri`s).
pub struct ImapEngine {
    host: String,
    port: u16,
    user: String,
    password: String,
    store: Arc<dyn MessageStore>,
    session: Mutex<Option<ImapSession>>,
}

impl ImapEngine {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        ImapEngine {
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
            store,
            session: Mutex::new(None),
        }
    }

    async fn connect(&self) -> SyncResult<ImapSession> {
        let mut root_store = RootCertStore::empty();
        for cert in load_native_certs()
            .map_err(|e| SyncError::Fatal(format!("loading native certs: {e}")))?
        {
            root_store
                .add(&tokio_rustls::rustls::Certificate(cert.0))
                .map_err(|e| SyncError::Fatal(format!("adding cert to root store: {e}")))?;
        }
        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let tcp = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| SyncError::TransientNetwork(format!("connecting to {}: {e}", self.host)))?;

        let server_name = ServerName::try_from(self.host.as_str())
            .map_err(|_| SyncError::Fatal(format!("invalid DNS name {}", self.host)))?;
        let tls_stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| SyncError::TransientNetwork(format!("TLS handshake: {e}")))?;

        let compat_stream = tls_stream.compat();
        let client = async_imap::Client::new(compat_stream);
        let session = client
            .login(&self.user, &self.password)
            .await
            .map_err(|(e, _client)| SyncError::ProtocolFailure(format!("LOGIN failed: {e}")))?;
        debug!(host = %self.host, "IMAP session established");
        Ok(session)
    }

    /// Runs `f` against the (lazily reconnected) session, reconnecting once
    /// on a dead connection before giving up.
    async fn with_session<T, F>(&self, f: F) -> Result<T, ExitCode>
    where
        F: for<'a> FnOnce(
            &'a mut ImapSession,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<T, async_imap::error::Error>> + Send + 'a>,
        >,
    {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            match self.connect().await {
                Ok(s) => *guard = Some(s),
                Err(_) => return Err(ExitCode::TransientNetwork),
            }
        }
        let session = guard.as_mut().expect("just connected");
        match f(session).await {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!(error = %e, "IMAP command failed");
                *guard = None;
                Err(classify(&e))
            }
        }
    }
}

fn classify(err: &async_imap::error::Error) -> ExitCode {
    use async_imap::error::Error as E;
    match err {
        E::Io(_) | E::ConnectionLost => ExitCode::TransientNetwork,
        E::No(_) | E::Bad(_) | E::Parse(_) | E::Validate(_) => ExitCode::ProtocolFailure,
        _ => ExitCode::Fatal,
    }
}

fn flag_str(flag: &MessageFlags) -> String {
    let mut parts = Vec::new();
    if flag.read {
        parts.push("\\Seen".to_string());
    }
    if flag.replied {
        parts.push("\\Answered".to_string());
    }
    if flag.flagged {
        parts.push("\\Flagged".to_string());
    }
    if flag.deleted {
        parts.push("\\Deleted".to_string());
    }
    if flag.forwarded {
        parts.push("$Forwarded".to_string());
    }
    if flag.mdn_sent {
        parts.push("$MDNSent".to_string());
    }
    parts.join(" ")
}

fn flags_from_fetch(fetch: &Fetch) -> MessageFlags {
    let mut flags = MessageFlags::default();
    for f in fetch.flags() {
        match f {
            Flag::Seen => flags.read = true,
            Flag::Answered => flags.replied = true,
            Flag::Flagged => flags.flagged = true,
            Flag::Deleted => flags.deleted = true,
            Flag::Custom(name) if name.as_ref() == "$Forwarded" => flags.forwarded = true,
            Flag::Custom(name) if name.as_ref() == "$MDNSent" => flags.mdn_sent = true,
            _ => {}
        }
    }
    flags
}

fn message_id_from_fetch(fetch: &Fetch) -> Option<String> {
    fetch
        .envelope()
        .and_then(|env| env.message_id.as_ref())
        .map(|mid| String::from_utf8_lossy(mid).trim().to_string())
}

fn uid_sequence(uids: &[Uid]) -> String {
    uids.iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ProtocolEngine for ImapEngine {
    async fn select_folder(&self, folder: &FolderUri) -> UrlOutcome<SelectOutcome> {
        let name = folder.0.clone();
        let mailbox = match self
            .with_session(move |s| Box::pin(async move { s.select(&name).await }))
            .await
        {
            Ok(mbox) => mbox,
            Err(code) => return UrlOutcome::failed(code),
        };

        let uid_validity = mailbox.uid_validity.unwrap_or(0);
        let uid_next = mailbox.uid_next;
        let total = mailbox.exists as i64;
        let recent = mailbox.recent as i64;

        let flag_state = if mailbox.exists > 0 {
            match self
                .with_session(move |s| Box::pin(async move {
                    let mut stream = s.fetch("1:*", "(UID FLAGS)").await?;
                    let mut entries = Vec::new();
                    while let Some(fetch) = stream.try_next().await? {
                        if let Some(uid) = fetch.uid {
                            let flags = flags_from_fetch(&fetch);
                            entries.push((uid, flags, flags.deleted));
                        }
                    }
                    Ok(entries)
                }))
                .await
            {
                Ok(entries) => Some(FlagState {
                    entries,
                    partial: false,
                }),
                Err(_) => None,
            }
        } else {
            Some(FlagState::default())
        };

        UrlOutcome::success(SelectOutcome {
            uid_validity,
            uid_next,
            total,
            recent,
            flag_state,
        })
    }

    async fn update_folder_status(&self, folder: &FolderUri) -> UrlOutcome<StatusOutcome> {
        let name = folder.0.clone();
        match self
            .with_session(move |s| Box::pin(async move { s.select(&name).await }))
            .await
        {
            Ok(mbox) => UrlOutcome::success(StatusOutcome {
                total: mbox.exists as i64,
                recent: mbox.recent as i64,
                unseen: mbox.unseen.unwrap_or(0) as i64,
                next_uid: mbox.uid_next.unwrap_or(0) as i64,
            }),
            Err(code) => UrlOutcome::failed(code),
        }
    }

    async fn fetch_message_bodies(&self, folder: &FolderUri, uids: &[Uid]) -> UrlOutcome<()> {
        if uids.is_empty() {
            return UrlOutcome::success(());
        }
        let name = folder.0.clone();
        let seq = uid_sequence(uids);
        let fetched = self
            .with_session(move |s| Box::pin(async move {
                s.select(&name).await?;
                let mut stream = s
                    .uid_fetch(&seq, "(UID FLAGS INTERNALDATE RFC822.SIZE ENVELOPE BODY.PEEK[])")
                    .await?;
                let mut out = Vec::new();
                while let Some(fetch) = stream.try_next().await? {
                    out.push(fetch);
                }
                Ok(out)
            }))
            .await;

        let fetched = match fetched {
            Ok(f) => f,
            Err(code) => return UrlOutcome::failed(code),
        };

        for fetch in &fetched {
            let Some(uid) = fetch.uid else { continue };
            let header = MessageHeader {
                uid,
                folder: folder.clone(),
                size: fetch.size.unwrap_or(0) as u64,
                date: fetch
                    .internal_date()
                    .map(|d| d.with_timezone(&chrono::Utc))
                    .unwrap_or_else(chrono::Utc::now),
                flags: flags_from_fetch(fetch),
                keywords: Vec::new(),
                is_offline: false,
                pending_removal: false,
                message_id: message_id_from_fetch(fetch),
                server_thread: None,
                label: None,
            };
            if let Err(e) = self.store.put_header(header).await {
                warn!(error = %e, "failed to persist fetched header");
                return UrlOutcome::failed(ExitCode::Fatal);
            }
            if let Some(body) = fetch.body() {
                if let Err(e) = self.store.store_message_bytes(folder, uid, body).await {
                    warn!(error = %e, "failed to persist fetched body");
                    return UrlOutcome::failed(ExitCode::Fatal);
                }
            }
        }
        UrlOutcome::success(())
    }

    async fn store_flags(
        &self,
        folder: &FolderUri,
        uids: &[Uid],
        add: bool,
        mask: FlagMask,
    ) -> UrlOutcome<()> {
        if uids.is_empty() {
            return UrlOutcome::success(());
        }
        let flags = flag_str(&mask);
        if flags.is_empty() {
            return UrlOutcome::success(());
        }
        let name = folder.0.clone();
        let seq = uid_sequence(uids);
        let query = format!("{}FLAGS ({flags})", if add { "+" } else { "-" });
        match self
            .with_session(move |s| Box::pin(async move {
                s.select(&name).await?;
                let mut stream = s.uid_store(&seq, &query).await?;
                while stream.try_next().await?.is_some() {}
                Ok(())
            }))
            .await
        {
            Ok(()) => UrlOutcome::success(()),
            Err(code) => UrlOutcome::failed(code),
        }
    }

    async fn store_keywords(
        &self,
        folder: &FolderUri,
        uids: &[Uid],
        add: bool,
        keywords: &KeywordSet,
    ) -> UrlOutcome<()> {
        if uids.is_empty() || keywords.is_empty() {
            return UrlOutcome::success(());
        }
        let name = folder.0.clone();
        let seq = uid_sequence(uids);
        let query = format!("{}FLAGS ({})", if add { "+" } else { "-" }, keywords.join(" "));
        match self
            .with_session(move |s| Box::pin(async move {
                s.select(&name).await?;
                let mut stream = s.uid_store(&seq, &query).await?;
                while stream.try_next().await?.is_some() {}
                Ok(())
            }))
            .await
        {
            Ok(()) => UrlOutcome::success(()),
            Err(code) => UrlOutcome::failed(code),
        }
    }

    async fn copy_messages(
        &self,
        source: &FolderUri,
        uids: &[Uid],
        dest: &FolderUri,
        is_move: bool,
    ) -> UrlOutcome<CopyOutcome> {
        if uids.is_empty() {
            return UrlOutcome::success(CopyOutcome::default());
        }
        let source_name = source.0.clone();
        let dest_name = dest.0.clone();
        let seq = uid_sequence(uids);
        let result = self
            .with_session(move |s| Box::pin(async move {
                s.select(&source_name).await?;
                if is_move {
                    if s.uid_mv(&seq, &dest_name).await.is_ok() {
                        return Ok(());
                    }
                    s.uid_copy(&seq, &dest_name).await?;
                    let mut stream = s.uid_store(&seq, "+FLAGS.SILENT (\\Deleted)").await?;
                    while stream.try_next().await?.is_some() {}
                    s.expunge().await?.try_collect::<Vec<_>>().await?;
                    Ok(())
                } else {
                    s.uid_copy(&seq, &dest_name).await?;
                    Ok(())
                }
            }))
            .await;

        match result {
            // UIDPLUS COPYUID is not exposed by this client; pseudo-header
            // rename falls back to a no-op when dest_uids is empty.
            Ok(()) => UrlOutcome::success(CopyOutcome::default()),
            Err(code) => UrlOutcome::failed(code),
        }
    }

    async fn append_message(&self, bytes: &[u8], dest: &FolderUri) -> UrlOutcome<AppendOutcome> {
        let dest_name = dest.0.clone();
        let bytes = bytes.to_vec();
        match self
            .with_session(move |s| Box::pin(async move { s.append(&dest_name, &bytes).await }))
            .await
        {
            Ok(()) => UrlOutcome::success(AppendOutcome { dest_uid: None }),
            Err(code) => UrlOutcome::failed(code),
        }
    }

    async fn create_folder(&self, parent: &FolderUri, name: &str) -> UrlOutcome<()> {
        let full_name = if parent.0.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", parent.0, name)
        };
        match self
            .with_session(move |s| Box::pin(async move { s.create(&full_name).await }))
            .await
        {
            Ok(()) => UrlOutcome::success(()),
            Err(code) => UrlOutcome::failed(code),
        }
    }

    async fn delete_all_messages(&self, folder: &FolderUri) -> UrlOutcome<()> {
        let name = folder.0.clone();
        match self
            .with_session(move |s| Box::pin(async move {
                s.select(&name).await?;
                let mut stream = s.uid_store("1:*", "+FLAGS.SILENT (\\Deleted)").await?;
                while stream.try_next().await?.is_some() {}
                s.expunge().await?.try_collect::<Vec<_>>().await?;
                Ok(())
            }))
            .await
        {
            Ok(()) => UrlOutcome::success(()),
            Err(code) => UrlOutcome::failed(code),
        }
    }

    fn supports_uidplus(&self) -> bool {
        false
    }

    fn supports_user_flags(&self) -> bool {
        true
    }
}
