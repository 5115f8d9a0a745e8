//! IMAP transport and session operations
//!
//! Timeout-bounded wrappers around `async-imap`. All connections use TLS;
//! fetches use `BODY.PEEK[]` so probing a mailbox never sets `\Seen`
//! implicitly. Logout is best-effort because teardown failures are not
//! actionable for the sync workflow.

use std::sync::Arc;
use std::time::Duration;

use async_imap::types::{Fetch, Flag};
use async_imap::{Client, Session};
use chrono::{DateTime, FixedOffset, NaiveDate};
use futures::TryStreamExt;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::errors::{AppError, AppResult};

/// TCP connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// TLS handshake / greeting / login timeout
const GREETING_TIMEOUT: Duration = Duration::from_secs(15);
/// Socket I/O timeout for commands and fetch streams
const SOCKET_TIMEOUT: Duration = Duration::from_secs(300);

/// Fetch batch size: some servers are sensitive to large literal responses
const FETCH_BATCH: usize = 20;

type TlsSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

/// One fetched message with the metadata the sync pipeline needs
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub uid: u32,
    pub raw: Vec<u8>,
    pub internal_date: Option<DateTime<FixedOffset>>,
    pub seen: bool,
}

/// Search criteria for one sync pass
#[derive(Debug, Clone, Default)]
pub struct SearchSpec {
    /// Restrict to this sender (FROM criterion) when non-empty
    pub sender: Option<String>,
    /// Restrict to messages on or after this date (SINCE criterion)
    pub since: Option<NaiveDate>,
    /// Restrict to unseen messages only
    pub unseen_only: bool,
    /// Client-side watermark: only UIDs strictly above this are returned
    pub min_uid_exclusive: Option<u32>,
}

/// Authenticated IMAP session over TLS
pub struct MailSession {
    session: TlsSession,
}

impl MailSession {
    /// Connect and authenticate
    ///
    /// Performs the full sequence with timeouts: TCP connect, TLS handshake
    /// with webpki roots, greeting read, LOGIN.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if the hostname is invalid for TLS SNI
    /// - `Timeout` if any connection phase times out
    /// - `AuthFailed` if authentication fails
    /// - `Internal` for TCP, TLS, or greeting failures
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        pass: &SecretString,
    ) -> AppResult<Self> {
        let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| AppError::Timeout("tcp connect timeout".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Internal(format!("tcp connect failed: {e}"))))?;

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));

        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|_| AppError::InvalidInput("invalid IMAP host for TLS SNI".to_owned()))?;
        let tls_stream = timeout(GREETING_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| AppError::Timeout("TLS handshake timeout".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Internal(format!("TLS handshake failed: {e}"))))?;

        let mut client = Client::new(tls_stream);
        let greeting = timeout(GREETING_TIMEOUT, client.read_response())
            .await
            .map_err(|_| AppError::Timeout("IMAP greeting timeout".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Internal(format!("IMAP greeting failed: {e}"))))?;
        if greeting.is_none() {
            return Err(AppError::Internal(
                "IMAP server closed connection before greeting".to_owned(),
            ));
        }

        let session = timeout(GREETING_TIMEOUT, client.login(user, pass.expose_secret()))
            .await
            .map_err(|_| AppError::Timeout("IMAP login timeout".to_owned()))
            .and_then(|r| {
                r.map_err(|(e, _)| {
                    let msg = e.to_string();
                    if msg.to_ascii_lowercase().contains("auth") || msg.contains("LOGIN") {
                        AppError::AuthFailed(msg)
                    } else {
                        AppError::Internal(msg)
                    }
                })
            })?;

        Ok(Self { session })
    }

    /// List all visible folders, decoded from modified UTF-7
    pub async fn list_folders(&mut self) -> AppResult<Vec<String>> {
        let stream = timeout(SOCKET_TIMEOUT, self.session.list(None, Some("*")))
            .await
            .map_err(|_| AppError::Timeout("LIST timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Internal(format!("LIST failed: {e}"))))?;
        let names: Vec<_> = timeout(SOCKET_TIMEOUT, stream.try_collect::<Vec<_>>())
            .await
            .map_err(|_| AppError::Timeout("LIST stream timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Internal(format!("LIST stream failed: {e}"))))?;
        Ok(names
            .into_iter()
            .map(|n| utf7_imap::decode_utf7_imap(n.name().to_owned()))
            .collect())
    }

    /// Select a folder, returning its UIDVALIDITY
    ///
    /// Read-only selection uses `EXAMINE` so mailbox state is untouched;
    /// the sync task selects read-write because it mutates `\Seen` later.
    pub async fn select(&mut self, folder: &str, readonly: bool) -> AppResult<u32> {
        let mailbox = if readonly {
            timeout(SOCKET_TIMEOUT, self.session.examine(folder))
                .await
                .map_err(|_| AppError::Timeout(format!("EXAMINE timed out for folder '{folder}'")))
                .and_then(|r| {
                    r.map_err(|e| AppError::NotFound(format!("cannot examine folder '{folder}': {e}")))
                })?
        } else {
            timeout(SOCKET_TIMEOUT, self.session.select(folder))
                .await
                .map_err(|_| AppError::Timeout(format!("SELECT timed out for folder '{folder}'")))
                .and_then(|r| {
                    r.map_err(|e| AppError::NotFound(format!("cannot select folder '{folder}': {e}")))
                })?
        };
        mailbox
            .uid_validity
            .ok_or_else(|| AppError::Internal("folder missing UIDVALIDITY".to_owned()))
    }

    /// Search for UIDs matching the criteria, ascending
    ///
    /// The watermark (`min_uid_exclusive`) is applied client-side because
    /// UID range criteria interact badly with some servers' SINCE handling.
    pub async fn search(&mut self, spec: &SearchSpec) -> AppResult<Vec<u32>> {
        let query = build_search_query(spec)?;
        debug!(query = %query, "UID SEARCH");
        let set = timeout(SOCKET_TIMEOUT, self.session.uid_search(&query))
            .await
            .map_err(|_| AppError::Timeout("UID SEARCH timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Internal(format!("uid search failed: {e}"))))?;
        let mut uids: Vec<u32> = set.into_iter().collect();
        uids.sort_unstable();
        if let Some(min) = spec.min_uid_exclusive {
            uids.retain(|&u| u > min);
        }
        Ok(uids)
    }

    /// Fetch raw messages plus flags and INTERNALDATE for a UID list
    ///
    /// Works in batches of [`FETCH_BATCH`]: metadata first (no literals),
    /// then bodies with `BODY.PEEK[]`, falling back to `RFC822` for servers
    /// that reject PEEK. Results keep the caller's UID order.
    pub async fn fetch_full(&mut self, uids: &[u32]) -> AppResult<Vec<FetchedMessage>> {
        let mut out = Vec::with_capacity(uids.len());
        for batch in uids.chunks(FETCH_BATCH) {
            let set = uid_set(batch);

            let meta = self.fetch_batch(&set, "(UID FLAGS INTERNALDATE)").await?;
            let bodies = match self.fetch_batch(&set, "(UID BODY.PEEK[])").await {
                Ok(fetched) => fetched,
                // Fallback for servers that don't accept BODY.PEEK[].
                Err(_) => self.fetch_batch(&set, "(UID RFC822)").await?,
            };

            for &uid in batch {
                let meta_fetch = meta.iter().find(|f| f.uid == Some(uid));
                let body_fetch = bodies.iter().find(|f| f.uid == Some(uid));

                let raw = body_fetch
                    .and_then(|f| f.body().map(|b| b.to_vec()))
                    .unwrap_or_default();
                let internal_date = meta_fetch.and_then(Fetch::internal_date);
                let seen = meta_fetch
                    .map(|f| f.flags().any(|flag| matches!(flag, Flag::Seen)))
                    .unwrap_or(false);

                out.push(FetchedMessage {
                    uid,
                    raw,
                    internal_date,
                    seen,
                });
            }
        }
        Ok(out)
    }

    async fn fetch_batch(&mut self, set: &str, query: &str) -> AppResult<Vec<Fetch>> {
        let stream = timeout(SOCKET_TIMEOUT, self.session.uid_fetch(set, query))
            .await
            .map_err(|_| AppError::Timeout("UID FETCH timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Internal(format!("uid fetch failed: {e}"))))?;
        timeout(SOCKET_TIMEOUT, stream.try_collect())
            .await
            .map_err(|_| AppError::Timeout("UID FETCH stream timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Internal(format!("uid fetch stream failed: {e}"))))
    }

    /// Add `\Seen` to one message
    pub async fn mark_seen(&mut self, uid: u32) -> AppResult<()> {
        self.store_flags(uid, "+FLAGS.SILENT (\\Seen)").await
    }

    /// Remove `\Seen` from one message (revert mode and smoke tests)
    pub async fn clear_seen(&mut self, uid: u32) -> AppResult<()> {
        self.store_flags(uid, "-FLAGS.SILENT (\\Seen)").await
    }

    async fn store_flags(&mut self, uid: u32, query: &str) -> AppResult<()> {
        let stream = timeout(
            SOCKET_TIMEOUT,
            self.session.uid_store(uid.to_string(), query),
        )
        .await
        .map_err(|_| AppError::Timeout("UID STORE timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Internal(format!("uid store failed: {e}"))))?;
        let _: Vec<Fetch> = timeout(SOCKET_TIMEOUT, stream.try_collect())
            .await
            .map_err(|_| AppError::Timeout("UID STORE stream timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Internal(format!("uid store stream failed: {e}"))))?;
        Ok(())
    }

    /// Log out, ignoring teardown errors
    pub async fn logout(mut self) {
        let _ = timeout(GREETING_TIMEOUT, self.session.logout()).await;
    }
}

/// Build the UID SEARCH query string for a spec
fn build_search_query(spec: &SearchSpec) -> AppResult<String> {
    let mut parts = Vec::new();
    if spec.unseen_only {
        parts.push("UNSEEN".to_owned());
    }
    if let Some(sender) = spec.sender.as_deref().filter(|s| !s.trim().is_empty()) {
        parts.push(format!("FROM \"{}\"", escape_imap_quoted(sender)?));
    }
    if let Some(since) = spec.since {
        parts.push(format!("SINCE {}", imap_date(since)));
    }
    if parts.is_empty() {
        Ok("ALL".to_owned())
    } else {
        Ok(parts.join(" "))
    }
}

/// RFC 3501 date format: `10-Jan-2025`
fn imap_date(date: NaiveDate) -> String {
    date.format("%d-%b-%Y").to_string()
}

fn escape_imap_quoted(input: &str) -> AppResult<String> {
    if input.chars().any(|c| c == '\r' || c == '\n') {
        return Err(AppError::invalid("search text must not contain CR or LF"));
    }
    Ok(input.replace('\\', "\\\\").replace('"', "\\\""))
}

fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{SearchSpec, build_search_query, escape_imap_quoted, imap_date, uid_set};

    #[test]
    fn empty_spec_searches_all() {
        assert_eq!(build_search_query(&SearchSpec::default()).expect("query"), "ALL");
    }

    #[test]
    fn full_spec_combines_criteria_in_order() {
        let spec = SearchSpec {
            sender: Some("alice@example.com".to_owned()),
            since: NaiveDate::from_ymd_opt(2025, 1, 10),
            unseen_only: true,
            min_uid_exclusive: Some(5),
        };
        assert_eq!(
            build_search_query(&spec).expect("query"),
            "UNSEEN FROM \"alice@example.com\" SINCE 10-Jan-2025"
        );
    }

    #[test]
    fn blank_sender_is_dropped_from_criteria() {
        let spec = SearchSpec {
            sender: Some("   ".to_owned()),
            ..SearchSpec::default()
        };
        assert_eq!(build_search_query(&spec).expect("query"), "ALL");
    }

    #[test]
    fn imap_date_uses_rfc3501_format() {
        let d = NaiveDate::from_ymd_opt(2025, 1, 2).expect("date");
        assert_eq!(imap_date(d), "02-Jan-2025");
    }

    #[test]
    fn quoted_text_escapes_backslash_and_quote() {
        assert_eq!(escape_imap_quoted(r#"a"b\c"#).expect("escape"), r#"a\"b\\c"#);
        assert!(escape_imap_quoted("bad\r\n").is_err());
    }

    #[test]
    fn uid_set_joins_with_commas() {
        assert_eq!(uid_set(&[1, 2, 42]), "1,2,42");
    }
}
