use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use itertools::Itertools;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::mail_reader::error::MailError;
use crate::mail_reader::Uid;

/// Login data handed over by a [`CredentialSource`].
#[derive(Clone)]
pub struct Credentials {
    pub host: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"********")
            .finish()
    }
}

/// Supplies credentials right before every connect. The session never looks
/// at how or where they are stored.
pub trait CredentialSource: Send + Sync {
    fn credentials(&self) -> Result<Credentials, MailError>;
}

/// Credentials known up front (configuration file, command line).
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub Credentials);

impl CredentialSource for StaticCredentials {
    fn credentials(&self) -> Result<Credentials, MailError> {
        Ok(self.0.clone())
    }
}

/// What the server reported on SELECT.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxStatus {
    pub exists: u32,
    pub uid_validity: Option<u32>,
    pub uid_next: Option<u32>,
}

/// Server ENVELOPE fields, still undecoded.
#[derive(Debug, Clone, Default)]
pub struct RawEnvelope {
    pub from: Vec<String>,
    pub date: Option<Vec<u8>>,
    pub subject: Option<Vec<u8>>,
}

/// One fetched message as it came off the wire.
#[derive(Debug, Clone, Default)]
pub struct RawMessage {
    pub body: Vec<u8>,
    pub envelope: Option<RawEnvelope>,
    pub flags: Vec<String>,
}

/// How a single IDLE round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// The server pushed an untagged response (EXISTS, EXPUNGE, FETCH...).
    NewData,
    /// Our own renewal timer fired.
    TimedOut,
    /// The server terminated the IDLE on its own (tagged completion or BYE).
    /// The connection is not usable afterwards.
    ServerEnded,
    /// Cancelled from our side.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Flag {
    Seen,
    Answered,
    Flagged,
    Deleted,
    Draft,
    Keyword(String),
}

impl Flag {
    /// Parses `\Seen`, `Seen`, `$Junk`...; anything that is not a system flag
    /// is kept as a keyword.
    pub fn parse(value: &str) -> Flag {
        let trimmed = value.trim();
        match trimmed.trim_start_matches('\\').to_ascii_lowercase().as_str() {
            "seen" => Flag::Seen,
            "answered" => Flag::Answered,
            "flagged" => Flag::Flagged,
            "deleted" => Flag::Deleted,
            "draft" => Flag::Draft,
            _ => Flag::Keyword(trimmed.to_string()),
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flag::Seen => write!(f, "\\Seen"),
            Flag::Answered => write!(f, "\\Answered"),
            Flag::Flagged => write!(f, "\\Flagged"),
            Flag::Deleted => write!(f, "\\Deleted"),
            Flag::Draft => write!(f, "\\Draft"),
            Flag::Keyword(keyword) => write!(f, "{}", keyword),
        }
    }
}

/// Mailbox commands filters may trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Move(String),
    Delete,
    SetFlag { flag: Flag, on: bool },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Move(folder) => write!(f, "MOVE {}", folder),
            Command::Delete => write!(f, "DELETE"),
            Command::SetFlag { flag, on: true } => write!(f, "+FLAGS {}", flag),
            Command::SetFlag { flag, on: false } => write!(f, "-FLAGS {}", flag),
        }
    }
}

/// Opens authenticated connections. The wire protocol lives behind this seam.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Connection;

    async fn connect(&self, credentials: &Credentials) -> Result<Self::Connection, MailError>;
}

/// One authenticated protocol connection.
#[async_trait]
pub trait Connection: Send {
    async fn select(&mut self, mailbox: &str) -> Result<MailboxStatus, MailError>;

    /// UIDs matching `UID from:*`, in whatever order the server sends them.
    async fn search_uids(&mut self, from: Uid) -> Result<Vec<Uid>, MailError>;

    /// Highest UID in the selected mailbox, `None` when it is empty.
    async fn highest_uid(&mut self) -> Result<Option<Uid>, MailError>;

    async fn fetch(&mut self, uid: Uid) -> Result<Option<RawMessage>, MailError>;

    async fn idle(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<IdleOutcome, MailError>;

    async fn execute(&mut self, uid: Uid, command: &Command) -> Result<(), MailError>;

    async fn logout(&mut self) -> Result<(), MailError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticated,
    Selected(String),
    Idling,
}

/// The single live session of the agent, bound to one mailbox.
pub struct SessionHandle<C: Connector> {
    connector: C,
    credentials: Arc<dyn CredentialSource>,
    mailbox: String,
    state: ConnectionState,
    connection: Option<C::Connection>,
    status: Option<MailboxStatus>,
    last_seen: Option<Uid>,
}

impl<C: Connector> SessionHandle<C> {
    pub fn new(
        connector: C,
        credentials: Arc<dyn CredentialSource>,
        mailbox: impl Into<String>,
    ) -> Self {
        Self {
            connector,
            credentials,
            mailbox: mailbox.into(),
            state: ConnectionState::Disconnected,
            connection: None,
            status: None,
            last_seen: None,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn mailbox(&self) -> &str {
        &self.mailbox
    }

    pub fn is_selected(&self) -> bool {
        matches!(self.state, ConnectionState::Selected(_))
    }

    pub fn last_seen(&self) -> Option<Uid> {
        self.last_seen
    }

    pub fn set_last_seen(&mut self, uid: Uid) {
        self.last_seen = Some(uid);
    }

    /// Logs in with fresh credentials. Leaves the session `Authenticated`.
    pub async fn connect(&mut self) -> Result<(), MailError> {
        self.drop_connection();
        self.state = ConnectionState::Connecting;

        let credentials = match self.credentials.credentials() {
            Ok(credentials) => credentials,
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                return Err(e);
            }
        };

        match self.connector.connect(&credentials).await {
            Ok(connection) => {
                info!("-- logged in to {} as {}", credentials.host, credentials.username);
                self.connection = Some(connection);
                self.state = ConnectionState::Authenticated;
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    pub async fn select_mailbox(&mut self, name: &str) -> Result<MailboxStatus, MailError> {
        let result = self.connection_mut()?.select(name).await;
        let status = self.track(result)?;

        info!("-- {} selected ({} messages)", name, status.exists);
        self.mailbox = name.to_string();
        self.status = Some(status);
        self.state = ConnectionState::Selected(name.to_string());
        Ok(status)
    }

    /// Tears down whatever is left of the old connection and logs in again,
    /// re-selecting the mailbox.
    pub async fn reconnect(&mut self) -> Result<MailboxStatus, MailError> {
        self.connect().await?;
        let mailbox = self.mailbox.clone();
        self.select_mailbox(&mailbox).await
    }

    /// Runs a move/delete/flag command. Returns once the server accepted it.
    pub async fn issue_command(&mut self, uid: Uid, command: &Command) -> Result<(), MailError> {
        self.ensure_selected()?;
        debug!("Issuing {} for message {}", command, uid);
        let result = self.connection_mut()?.execute(uid, command).await;
        self.track(result)
    }

    /// UIDs above `after`, ascending and without duplicates.
    pub async fn search_after(&mut self, after: Uid) -> Result<Vec<Uid>, MailError> {
        self.ensure_selected()?;
        let result = self.connection_mut()?.search_uids(after.saturating_add(1)).await;
        let uids = self.track(result)?;

        // `UID n:*` always matches the highest message, even below n.
        Ok(uids
            .into_iter()
            .filter(|uid| *uid > after)
            .sorted()
            .dedup()
            .collect())
    }

    pub async fn highest_uid(&mut self) -> Result<Option<Uid>, MailError> {
        self.ensure_selected()?;
        let result = self.connection_mut()?.highest_uid().await;
        self.track(result)
    }

    pub async fn fetch(&mut self, uid: Uid) -> Result<Option<RawMessage>, MailError> {
        self.ensure_selected()?;
        let result = self.connection_mut()?.fetch(uid).await;
        self.track(result)
    }

    /// Blocks in IDLE until the server reports something, `timeout` elapses or
    /// `cancel` fires. Only one IDLE can be outstanding since this takes
    /// `&mut self`.
    pub async fn idle(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<IdleOutcome, MailError> {
        self.ensure_selected()?;
        self.state = ConnectionState::Idling;
        let result = self.connection_mut()?.idle(timeout, cancel).await;
        let outcome = self.track(result)?;

        if outcome == IdleOutcome::ServerEnded {
            self.relogin_after_server_ended().await?;
        } else {
            self.state = ConnectionState::Selected(self.mailbox.clone());
        }
        Ok(outcome)
    }

    /// Logs in again right away so the caller can renew the IDLE. A changed
    /// UIDVALIDITY is reported as a connection error for the caller to
    /// re-baseline.
    async fn relogin_after_server_ended(&mut self) -> Result<(), MailError> {
        info!("Server ended the IDLE on {}, logging in again", self.mailbox);
        let previous = self.status.and_then(|status| status.uid_validity);
        let status = self.reconnect().await?;
        if previous.is_some() && status.uid_validity != previous {
            self.drop_connection();
            return Err(MailError::Protocol(format!(
                "UIDVALIDITY of {} changed from {:?} to {:?}",
                self.mailbox, previous, status.uid_validity
            )));
        }
        Ok(())
    }

    /// Logs out if there is anything to log out of.
    pub async fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            match connection.logout().await {
                Ok(()) => info!("-- logged out"),
                Err(e) => warn!("Logout failed: {}", e),
            }
        }
        self.state = ConnectionState::Disconnected;
    }

    fn ensure_selected(&self) -> Result<(), MailError> {
        match self.state {
            ConnectionState::Selected(_) => Ok(()),
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                Err(MailError::NotConnected)
            }
            _ => Err(MailError::Protocol(format!(
                "no mailbox selected (state {:?})",
                self.state
            ))),
        }
    }

    fn connection_mut(&mut self) -> Result<&mut C::Connection, MailError> {
        self.connection.as_mut().ok_or(MailError::NotConnected)
    }

    fn drop_connection(&mut self) {
        self.connection = None;
        self.state = ConnectionState::Disconnected;
    }

    /// A connection-class error means the connection can't be trusted anymore.
    fn track<T>(&mut self, result: Result<T, MailError>) -> Result<T, MailError> {
        if let Err(e) = &result {
            if e.is_connection_lost() {
                warn!("Connection to {} lost: {}", self.mailbox, e);
                self.drop_connection();
            } else if self.state == ConnectionState::Idling {
                self.state = ConnectionState::Selected(self.mailbox.clone());
            }
        }
        result
    }
}
