//! IMAP over TLS: connection setup, search criteria and paging cursors.

use async_imap::error::Error as ImapError;
use async_imap::types::{Fetch, Flag};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use rustls::pki_types::ServerName;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use ferry_core::error::{ErrorCode, FerryError, FerryResult};

pub type ImapClient = async_imap::Client<TlsStream<TcpStream>>;
pub type ImapSession = async_imap::Session<TlsStream<TcpStream>>;

/// Items requested per message. `BODY.PEEK` leaves `\Seen` untouched.
const FETCH_ITEMS: &str = "(UID FLAGS INTERNALDATE BODY.PEEK[])";

/// Open a TLS connection to `host:port`.
pub async fn connect(host: &str, port: u16, timeout: Duration) -> FerryResult<ImapClient> {
    let tcp = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| FerryError::Timeout(format!("connecting to {}:{}", host, port)))?
        .map_err(|e| {
            FerryError::network_with_source(format!("cannot connect to {}:{}", host, port), e)
        })?;

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| FerryError::Configuration(format!("invalid IMAP host '{}'", host)))?;
    let tls = tokio::time::timeout(timeout, tls_connector()?.connect(server_name, tcp))
        .await
        .map_err(|_| FerryError::Timeout(format!("TLS handshake with {}", host)))?
        .map_err(|e| FerryError::network_with_source(format!("TLS handshake with {} failed", host), e))?;

    Ok(async_imap::Client::new(tls))
}

fn tls_connector() -> FerryResult<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| FerryError::internal(format!("TLS configuration failed: {}", e)))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Map an IMAP error; `context` names the command.
pub fn imap_error(context: &str, err: ImapError) -> FerryError {
    match err {
        ImapError::Io(io) => FerryError::network_with_source(format!("imap {} failed", context), io),
        ImapError::ConnectionLost => {
            FerryError::network(format!("imap connection lost during {}", context))
        }
        ImapError::No(msg) | ImapError::Bad(msg) => FerryError::Provider {
            message: format!("imap {} refused: {}", context, msg),
            code: ErrorCode::PrvBadRequest,
        },
        other => FerryError::Parse {
            message: format!("imap {}: {}", context, other),
            code: ErrorCode::ParseInvalidMime,
        },
    }
}

/// Map a failed LOGIN/AUTHENTICATE. A refusal is final; transport errors are not.
pub fn login_error(err: ImapError) -> FerryError {
    match err {
        ImapError::No(msg) | ImapError::Bad(msg) => {
            FerryError::authentication(format!("imap login rejected: {}", msg))
        }
        other => imap_error("login", other),
    }
}

/// IMAP SEARCH criteria for the unread flag and look-back window.
pub fn search_criteria(unread_only: bool, since: Option<DateTime<Utc>>) -> String {
    let mut parts = Vec::new();
    if unread_only {
        parts.push("UNSEEN".to_string());
    }
    if let Some(since) = since {
        parts.push(format!("SINCE {}", since.format("%d-%b-%Y")));
    }
    if parts.is_empty() {
        "ALL".to_string()
    } else {
        parts.join(" ")
    }
}

/// Position within the configured folders: folder index and offset into that
/// folder's ascending UID list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailCursor {
    pub folder: usize,
    pub offset: usize,
}

impl MailCursor {
    pub fn parse(raw: &str) -> FerryResult<Self> {
        let invalid = || FerryError::parse(format!("invalid mail cursor '{}'", raw));
        let (folder, offset) = raw.split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            folder: folder.parse().map_err(|_| invalid())?,
            offset: offset.parse().map_err(|_| invalid())?,
        })
    }

    /// Cursor following a batch of `taken` UIDs out of `total` in this folder.
    pub fn advance(self, taken: usize, total: usize, folders: usize) -> Option<Self> {
        let offset = self.offset + taken;
        if offset < total {
            Some(Self {
                folder: self.folder,
                offset,
            })
        } else if self.folder + 1 < folders {
            Some(Self {
                folder: self.folder + 1,
                offset: 0,
            })
        } else {
            None
        }
    }
}

impl fmt::Display for MailCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.folder, self.offset)
    }
}

/// One fetched message.
pub struct FetchedMail {
    pub uid: u32,
    pub seen: bool,
    /// When the server received the message.
    pub internal_date: Option<DateTime<Utc>>,
    pub raw: Vec<u8>,
}

/// A logged-in session plus the per-folder UID lists of this run.
#[derive(Default)]
pub struct Mailbox {
    session: Option<ImapSession>,
    selected: Option<String>,
    uids: HashMap<String, Vec<u32>>,
}

impl Mailbox {
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn attach(&mut self, session: ImapSession) {
        self.session = Some(session);
        self.selected = None;
    }

    /// Forget a broken session so the next call reconnects.
    pub fn detach(&mut self) -> Option<ImapSession> {
        self.selected = None;
        self.session.take()
    }

    pub fn cached_uids(&self, folder: &str) -> Option<&[u32]> {
        self.uids.get(folder).map(Vec::as_slice)
    }

    fn session(&mut self) -> FerryResult<&mut ImapSession> {
        self.session
            .as_mut()
            .ok_or_else(|| FerryError::network("imap session is not open"))
    }

    async fn examine(&mut self, folder: &str) -> FerryResult<()> {
        if self.selected.as_deref() == Some(folder) {
            return Ok(());
        }
        self.session()?
            .examine(folder)
            .await
            .map_err(|e| imap_error("EXAMINE", e))?;
        self.selected = Some(folder.to_string());
        Ok(())
    }

    /// Search `folder` and cache its UIDs in ascending order.
    pub async fn search(&mut self, folder: &str, criteria: &str) -> FerryResult<&[u32]> {
        if !self.uids.contains_key(folder) {
            self.examine(folder).await?;
            let found = self
                .session()?
                .uid_search(criteria)
                .await
                .map_err(|e| imap_error("UID SEARCH", e))?;
            let mut uids: Vec<u32> = found.into_iter().collect();
            uids.sort_unstable();
            tracing::debug!(folder, criteria, matches = uids.len(), "folder searched");
            self.uids.insert(folder.to_string(), uids);
        }
        Ok(self.cached_uids(folder).unwrap_or_default())
    }

    /// Fetch full messages for `uids` in `folder`, ordered by UID.
    pub async fn fetch(&mut self, folder: &str, uids: &[u32]) -> FerryResult<Vec<FetchedMail>> {
        self.examine(folder).await?;
        let set = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let fetches: Vec<Fetch> = self
            .session()?
            .uid_fetch(&set, FETCH_ITEMS)
            .await
            .map_err(|e| imap_error("UID FETCH", e))?
            .try_collect()
            .await
            .map_err(|e| imap_error("UID FETCH", e))?;

        let mut mails: Vec<FetchedMail> = fetches
            .iter()
            .filter_map(|fetch| {
                let uid = fetch.uid?;
                let raw = fetch.body()?.to_vec();
                let seen = fetch.flags().any(|flag| matches!(flag, Flag::Seen));
                let internal_date = fetch.internal_date().map(|d| d.with_timezone(&Utc));
                Some(FetchedMail {
                    uid,
                    seen,
                    internal_date,
                    raw,
                })
            })
            .collect();
        mails.sort_by_key(|m| m.uid);
        Ok(mails)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_search_criteria() {
        let since = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
        assert_eq!(search_criteria(false, None), "ALL");
        assert_eq!(search_criteria(true, None), "UNSEEN");
        assert_eq!(search_criteria(false, Some(since)), "SINCE 05-Mar-2024");
        assert_eq!(search_criteria(true, Some(since)), "UNSEEN SINCE 05-Mar-2024");
    }

    #[test]
    fn test_cursor_walks_folders() {
        let start = MailCursor::default();
        let next = start.advance(50, 120, 2).unwrap();
        assert_eq!(next, MailCursor { folder: 0, offset: 50 });
        assert_eq!(next.to_string(), "0:50");
        assert_eq!(MailCursor::parse("0:50").unwrap(), next);

        let last_of_first = MailCursor { folder: 0, offset: 100 };
        assert_eq!(
            last_of_first.advance(20, 120, 2),
            Some(MailCursor { folder: 1, offset: 0 })
        );
        assert_eq!(MailCursor { folder: 1, offset: 0 }.advance(7, 7, 2), None);
        assert!(MailCursor::parse("inbox").is_err());
    }
}
