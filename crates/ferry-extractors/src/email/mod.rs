//! IMAP mail extraction.
//!
//! Messages are searched per folder, paged by UID and fetched with
//! `BODY.PEEK[]`, so extraction never marks mail as read. Attachments arrive
//! inside the MIME body and are handed to the runner as inline bytes.

mod imap;
mod oauth;
mod parse;

pub use imap::{search_criteria, MailCursor};
pub use oauth::{OAuthCredentials, XOAuth2};
pub use parse::{parse_message, MailboxPosition};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

use ferry_core::config::{EmailAccountConfig, EmailAuth};
use ferry_core::error::{ErrorKind, FerryResult};
use ferry_core::{
    ExtractionFilter, ExtractorContext, Page, RequestPolicy, SourceExtractor, SourceKind,
};

use crate::http::{HttpAuth, ProviderClient};
use imap::{login_error, FetchedMail, Mailbox};

enum MailAuth {
    Password(SecretString),
    OAuth2 {
        credentials: OAuthCredentials,
        token_client: ProviderClient,
    },
}

/// [`SourceExtractor`] for one IMAP account.
pub struct EmailExtractor {
    config: EmailAccountConfig,
    auth: MailAuth,
    policy: RequestPolicy,
    timeout: Duration,
    mailbox: Mutex<Mailbox>,
}

impl EmailExtractor {
    /// Resolve credentials for `config`. Nothing is contacted yet.
    pub fn from_config(config: &EmailAccountConfig, ctx: ExtractorContext) -> FerryResult<Self> {
        let auth = match &config.auth {
            EmailAuth::AppPassword { password_env } => {
                MailAuth::Password(ctx.credentials.resolve(password_env)?)
            }
            EmailAuth::Oauth2 {
                client_id_env,
                client_secret_env,
                refresh_token_env,
                token_url,
            } => MailAuth::OAuth2 {
                credentials: OAuthCredentials {
                    client_id: ctx.credentials.resolve(client_id_env)?,
                    client_secret: ctx.credentials.resolve(client_secret_env)?,
                    refresh_token: ctx.credentials.resolve(refresh_token_env)?,
                    token_url: token_url.clone(),
                },
                token_client: ProviderClient::new(
                    "oauth2 token endpoint",
                    HttpAuth::None,
                    ctx.policy.clone(),
                    ctx.request_timeout,
                )?,
            },
        };
        Ok(Self {
            config: config.clone(),
            auth,
            policy: ctx.policy,
            timeout: ctx.request_timeout,
            mailbox: Mutex::new(Mailbox::default()),
        })
    }

    async fn login(&self) -> FerryResult<imap::ImapSession> {
        let client =
            imap::connect(&self.config.imap_server, self.config.imap_port, self.timeout).await?;
        let session = match &self.auth {
            MailAuth::Password(password) => client
                .login(&self.config.address, password.expose_secret())
                .await
                .map_err(|(e, _)| login_error(e))?,
            MailAuth::OAuth2 {
                credentials,
                token_client,
            } => {
                let token = credentials.access_token(token_client).await?;
                client
                    .authenticate("XOAUTH2", XOAuth2::new(&self.config.address, token))
                    .await
                    .map_err(|(e, _)| login_error(e))?
            }
        };
        tracing::debug!(account = %self.config.name, server = %self.config.imap_server, "imap session opened");
        Ok(session)
    }

    /// Lock the mailbox, logging in first when there is no live session.
    async fn connected(&self) -> FerryResult<MutexGuard<'_, Mailbox>> {
        let mut mailbox = self.mailbox.lock().await;
        if !mailbox.is_connected() {
            let session = self.login().await?;
            mailbox.attach(session);
        }
        Ok(mailbox)
    }

    /// Search `folder` and return its match count plus the UIDs of one page.
    async fn search_page(
        &self,
        folder: &str,
        criteria: &str,
        cursor: MailCursor,
        batch: usize,
    ) -> FerryResult<(usize, Vec<u32>)> {
        self.policy
            .execute("imap search", || async move {
                let mut mailbox = self.connected().await?;
                let result = mailbox.search(folder, criteria).await.map(|uids| {
                    let page: Vec<u32> =
                        uids.iter().skip(cursor.offset).take(batch).copied().collect();
                    (uids.len(), page)
                });
                settle(&mut mailbox, result)
            })
            .await
    }

    async fn fetch_mail(&self, folder: &str, uids: &[u32]) -> FerryResult<Vec<FetchedMail>> {
        self.policy
            .execute("imap fetch", || async move {
                let mut mailbox = self.connected().await?;
                let result = mailbox.fetch(folder, uids).await;
                settle(&mut mailbox, result)
            })
            .await
    }
}

/// Drop the session after a transport failure so the retry reconnects.
fn settle<T>(mailbox: &mut Mailbox, result: FerryResult<T>) -> FerryResult<T> {
    if let Err(err) = &result {
        if matches!(err.kind(), ErrorKind::Network | ErrorKind::Timeout) {
            mailbox.detach();
        }
    }
    result
}

#[async_trait]
impl SourceExtractor for EmailExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::Email
    }

    fn account(&self) -> &str {
        &self.config.name
    }

    async fn authenticate(&self) -> FerryResult<()> {
        self.policy
            .execute("imap login", || async move { self.connected().await.map(|_| ()) })
            .await
    }

    async fn fetch_page(
        &self,
        filter: &ExtractionFilter,
        cursor: Option<&str>,
    ) -> FerryResult<Page> {
        let folders = &self.config.folders;
        let criteria = search_criteria(filter.unread_only, filter.since);
        let batch = filter.batch_size.max(1) as usize;
        let mut position = cursor.map(MailCursor::parse).transpose()?.unwrap_or_default();

        loop {
            let Some(folder) = folders.get(position.folder) else {
                return Ok(Page::default());
            };

            let (total, uids) = self
                .search_page(folder, &criteria, position, batch)
                .await?;

            if uids.is_empty() {
                match position.advance(0, 0, folders.len()) {
                    Some(next) => {
                        position = next;
                        continue;
                    }
                    None => return Ok(Page::default()),
                }
            }

            let fetched = self.fetch_mail(folder, &uids).await?;

            let mut records = Vec::with_capacity(fetched.len());
            for mail in fetched {
                let position = MailboxPosition {
                    folder,
                    uid: mail.uid,
                    seen: mail.seen,
                    internal_date: mail.internal_date,
                };
                match parse_message(&mail.raw, position) {
                    Ok(record) => records.push(record),
                    Err(e) => tracing::warn!(
                        account = %self.config.name,
                        folder = %folder,
                        uid = mail.uid,
                        "skipping unparseable message: {}",
                        e
                    ),
                }
            }

            let next = position.advance(uids.len(), total, folders.len());
            return Ok(Page {
                records,
                next_cursor: next.map(|c| c.to_string()),
            });
        }
    }

    async fn close(&self) {
        let session = self.mailbox.lock().await.detach();
        if let Some(mut session) = session {
            if let Err(e) = session.logout().await {
                tracing::debug!(account = %self.config.name, "imap logout failed: {}", e);
            }
        }
    }
}
