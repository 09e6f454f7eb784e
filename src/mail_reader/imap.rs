use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_imap::types::{Fetch, Flag as ImapFlag};
use async_imap::{Client, Session};
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use futures::{StreamExt, TryStreamExt};
use imap_proto::{Address, Response, Status};
use log::{debug, info};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;

use crate::mail_reader::error::MailError;
use crate::mail_reader::session::{
    Command, Connection, Connector, Credentials, IdleOutcome, MailboxStatus, RawEnvelope,
    RawMessage,
};
use crate::mail_reader::Uid;

type ImapStream = Compat<tokio_native_tls::TlsStream<TcpStream>>;

const FETCH_QUERY: &str = "(UID FLAGS ENVELOPE BODY.PEEK[])";

/// Opens TLS connections to an IMAP server with `async-imap`.
#[derive(Debug, Clone)]
pub struct ImapConnector {
    pub port: u16,
    pub connect_timeout: Duration,
    /// Upper bound for any single command, DONE included.
    pub command_timeout: Duration,
}

// Establish a TLS-encrypted connection to the IMAP server
async fn connect_to_server(
    server: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<tokio_native_tls::TlsStream<TcpStream>, MailError> {
    let imap_addr = (server, port);
    let tcp_stream = tokio::time::timeout(connect_timeout, TcpStream::connect(imap_addr))
        .await
        .map_err(|_| MailError::Network(format!("timed out connecting to {}:{}", server, port)))??;
    let connector = native_tls::TlsConnector::new()
        .map_err(|e| MailError::Network(format!("TLS setup failed: {}", e)))?;
    let tls = tokio_native_tls::TlsConnector::from(connector);
    let tls_stream = tls
        .connect(server, tcp_stream)
        .await
        .map_err(|e| MailError::Network(format!("TLS handshake with {} failed: {}", server, e)))?;

    info!("-- connected to {}:{}", server, port);
    Ok(tls_stream)
}

// Login to the IMAP server and return an authenticated session
async fn login_to_server<T>(
    client: Client<T>,
    username: &str,
    password: &str,
) -> Result<Session<T>, MailError>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
{
    client
        .login(username, password)
        .await
        .map_err(|(e, _client)| match e {
            async_imap::error::Error::No(msg) | async_imap::error::Error::Bad(msg) => {
                MailError::Auth(msg)
            }
            other => MailError::from(other),
        })
}

/// Runs `command`, giving up after `limit`. A silent server is treated like a
/// dead one.
async fn bounded<R>(
    limit: Duration,
    what: &str,
    command: impl Future<Output = Result<R, MailError>>,
) -> Result<R, MailError> {
    match tokio::time::timeout(limit, command).await {
        Ok(result) => result,
        Err(_) => Err(MailError::Network(format!(
            "{} got no answer within {:?}",
            what, limit
        ))),
    }
}

#[async_trait]
impl Connector for ImapConnector {
    type Connection = ImapConnection;

    async fn connect(&self, credentials: &Credentials) -> Result<ImapConnection, MailError> {
        let tls_stream =
            connect_to_server(&credentials.host, self.port, self.connect_timeout).await?;
        let client = Client::new(tls_stream.compat());
        let session = bounded(
            self.command_timeout,
            "LOGIN",
            login_to_server(client, &credentials.username, &credentials.password),
        )
        .await?;
        Ok(ImapConnection::new(session, self.command_timeout))
    }
}

/// A logged-in `async-imap` session. IDLE consumes the session, so it is
/// parked in an `Option` while the IDLE handle owns it. After the server
/// ended an IDLE by itself the session is gone for good.
pub struct ImapConnection<T = ImapStream>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug,
{
    session: Option<Session<T>>,
    command_timeout: Duration,
}

impl<T> ImapConnection<T>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
{
    pub fn new(session: Session<T>, command_timeout: Duration) -> Self {
        Self {
            session: Some(session),
            command_timeout,
        }
    }

    fn session(&mut self) -> Result<&mut Session<T>, MailError> {
        self.session.as_mut().ok_or(MailError::NotConnected)
    }
}

fn uid_set(uid: Uid) -> String {
    uid.to_string()
}

fn format_address(address: &Address<'_>) -> String {
    let mailbox = address.mailbox.as_deref().map(String::from_utf8_lossy);
    let host = address.host.as_deref().map(String::from_utf8_lossy);
    let email = match (mailbox, host) {
        (Some(mailbox), Some(host)) => format!("{}@{}", mailbox, host),
        (Some(mailbox), None) => mailbox.into_owned(),
        (None, Some(host)) => host.into_owned(),
        (None, None) => String::new(),
    };

    match address.name.as_deref() {
        Some(name) if !name.is_empty() => {
            format!("{} <{}>", String::from_utf8_lossy(name), email)
        }
        _ => email,
    }
}

fn raw_envelope(fetch: &Fetch) -> Option<RawEnvelope> {
    let envelope = fetch.envelope()?;
    Some(RawEnvelope {
        from: envelope
            .from
            .iter()
            .flatten()
            .map(format_address)
            .filter(|sender| !sender.is_empty())
            .collect(),
        date: envelope.date.as_deref().map(<[u8]>::to_vec),
        subject: envelope.subject.as_deref().map(<[u8]>::to_vec),
    })
}

fn flag_name(flag: &ImapFlag<'_>) -> String {
    match flag {
        ImapFlag::Seen => "\\Seen".to_string(),
        ImapFlag::Answered => "\\Answered".to_string(),
        ImapFlag::Flagged => "\\Flagged".to_string(),
        ImapFlag::Deleted => "\\Deleted".to_string(),
        ImapFlag::Draft => "\\Draft".to_string(),
        ImapFlag::Recent => "\\Recent".to_string(),
        ImapFlag::Custom(name) => name.to_string(),
        other => format!("{:?}", other),
    }
}

fn command_error(uid: Uid, command: &Command, err: async_imap::error::Error) -> MailError {
    match err {
        async_imap::error::Error::No(reason) | async_imap::error::Error::Bad(reason) => {
            MailError::Command {
                uid,
                command: command.to_string(),
                reason,
            }
        }
        other => MailError::from(other),
    }
}

#[async_trait]
impl<T> Connection for ImapConnection<T>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
{
    async fn select(&mut self, mailbox: &str) -> Result<MailboxStatus, MailError> {
        let limit = self.command_timeout;
        let session = self.session()?;
        let mailbox_data = bounded(limit, "SELECT", async move {
            Ok(session.select(mailbox).await?)
        })
        .await?;
        Ok(MailboxStatus {
            exists: mailbox_data.exists,
            uid_validity: mailbox_data.uid_validity,
            uid_next: mailbox_data.uid_next,
        })
    }

    async fn search_uids(&mut self, from: Uid) -> Result<Vec<Uid>, MailError> {
        let limit = self.command_timeout;
        let session = self.session()?;
        let query = format!("UID {}:*", from);
        let uids = bounded(limit, "UID SEARCH", async move {
            Ok(session.uid_search(&query).await?)
        })
        .await?;
        Ok(uids.into_iter().collect())
    }

    async fn highest_uid(&mut self) -> Result<Option<Uid>, MailError> {
        let limit = self.command_timeout;
        let session = self.session()?;
        let uids = bounded(limit, "UID SEARCH", async move {
            Ok(session.uid_search("UID *").await?)
        })
        .await?;
        Ok(uids.into_iter().max())
    }

    async fn fetch(&mut self, uid: Uid) -> Result<Option<RawMessage>, MailError> {
        let limit = self.command_timeout;
        let session = self.session()?;
        let messages: Vec<Fetch> = bounded(limit, "UID FETCH", async move {
            let messages: Vec<Fetch> = session
                .uid_fetch(uid_set(uid), FETCH_QUERY)
                .await?
                .try_collect()
                .await?;
            Ok(messages)
        })
        .await?;

        // Unsolicited FETCH responses for other messages may be mixed in.
        let Some(message) = messages.iter().find(|m| m.uid == Some(uid)) else {
            return Ok(None);
        };

        Ok(Some(RawMessage {
            body: message.body().map(<[u8]>::to_vec).unwrap_or_default(),
            envelope: raw_envelope(message),
            flags: message.flags().map(|flag| flag_name(&flag)).collect(),
        }))
    }

    async fn idle(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<IdleOutcome, MailError> {
        let limit = self.command_timeout;
        let session = self.session.take().ok_or(MailError::NotConnected)?;
        let mut handle = session.idle();
        bounded(limit, "IDLE", async { Ok(handle.init().await?) }).await?;
        debug!("IDLE started, renewing in {:?}", timeout);

        // The deadline covers the whole IDLE; keepalives don't push it back.
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break IdleOutcome::Interrupted,
                _ = &mut deadline => break IdleOutcome::TimedOut,
                response = handle.next() => {
                    let response = match response {
                        Some(response) => response?,
                        None => {
                            return Err(MailError::Network(
                                "connection closed while idling".to_string(),
                            ))
                        }
                    };
                    match response.parsed() {
                        // "* OK Still here" and friends
                        Response::Data { status: Status::Ok, .. } | Response::Continue { .. } => {}
                        // Only IDLE is in flight, so any tagged completion is its own.
                        Response::Done { .. } | Response::Data { status: Status::Bye, .. } => {
                            break IdleOutcome::ServerEnded
                        }
                        _ => break IdleOutcome::NewData,
                    }
                }
            }
        };

        if outcome == IdleOutcome::ServerEnded {
            // The IDLE tag is already consumed, DONE would never be answered.
            debug!("Server ended the IDLE");
            return Ok(outcome);
        }

        // DONE always goes out, also on cancellation, so the session is never
        // left half way in IDLE.
        let session = bounded(limit, "DONE", async move { Ok(handle.done().await?) }).await?;
        self.session = Some(session);
        Ok(outcome)
    }

    async fn execute(&mut self, uid: Uid, command: &Command) -> Result<(), MailError> {
        let limit = self.command_timeout;
        let session = self.session()?;
        let uids = uid_set(uid);
        bounded(limit, "command", async move {
            match command {
                Command::Move(folder) => session
                    .uid_mv(&uids, folder)
                    .await
                    .map_err(|e| command_error(uid, command, e)),
                Command::Delete => {
                    session
                        .uid_store(&uids, "+FLAGS.SILENT (\\Deleted)")
                        .await
                        .map_err(|e| command_error(uid, command, e))?
                        .try_collect::<Vec<_>>()
                        .await?;
                    session
                        .uid_expunge(&uids)
                        .await
                        .map_err(|e| command_error(uid, command, e))?
                        .try_collect::<Vec<_>>()
                        .await?;
                    Ok(())
                }
                Command::SetFlag { flag, on } => {
                    let query = format!("{}FLAGS.SILENT ({})", if *on { "+" } else { "-" }, flag);
                    session
                        .uid_store(&uids, &query)
                        .await
                        .map_err(|e| command_error(uid, command, e))?
                        .try_collect::<Vec<_>>()
                        .await?;
                    Ok(())
                }
            }
        })
        .await
    }

    async fn logout(&mut self) -> Result<(), MailError> {
        let limit = self.command_timeout;
        // Be nice to the server and log out
        if let Some(mut session) = self.session.take() {
            bounded(limit, "LOGOUT", async move { Ok(session.logout().await?) }).await?;
        }
        Ok(())
    }
}
