//! In-memory IMAP server used by the tests. It speaks the `Connector` /
//! `Connection` traits directly and plays back a script of IDLE events.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::filters::command::CommandInterface;
use crate::filters::{Filter, FilterError, FilterResult};
use crate::mail_reader::error::MailError;
use crate::mail_reader::message::{Envelope, Message};
use crate::mail_reader::session::{
    Command, Connection, Connector, Credentials, IdleOutcome, MailboxStatus, RawEnvelope,
    RawMessage, StaticCredentials,
};
use crate::mail_reader::Uid;

pub fn credentials(password: &str) -> StaticCredentials {
    StaticCredentials(Credentials {
        host: "imap.example.com".to_string(),
        username: "me@example.com".to_string(),
        password: password.to_string(),
    })
}

/// Builds a small RFC 5322 message.
pub fn mail(from: &str, subject: &str, body: &str) -> Vec<u8> {
    format!(
        "From: {}\r\nTo: me@example.com\r\nSubject: {}\r\nDate: Tue, 1 Jul 2025 10:52:37 +0200\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}\r\n",
        from, subject, body
    )
    .into_bytes()
}

#[derive(Debug, Clone)]
pub enum IdleStep {
    /// New messages land in the mailbox and the server wakes the IDLE.
    Deliver(Vec<(Uid, Vec<u8>)>),
    /// The server ends the IDLE with a tagged OK; the connection is spent.
    ServerEnded,
    /// Our renewal timeout fires.
    TimedOut,
    /// The socket dies while idling.
    Disconnect,
}

#[derive(Default)]
struct ServerState {
    password: String,
    uid_validity: u32,
    messages: BTreeMap<Uid, RawMessage>,
    script: VecDeque<IdleStep>,
    generation: u64,
    refuse_connects: usize,
    fail_fetch_once: HashSet<Uid>,
    reject_commands: bool,
    connects: usize,
    idles: usize,
    fetches: Vec<Uid>,
    commands: Vec<(Uid, Command)>,
    stop_when_idle: Option<CancellationToken>,
}

#[derive(Clone)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub fn new(password: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                password: password.to_string(),
                uid_validity: 1,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            server: self.clone(),
        }
    }

    pub fn add_message(&self, uid: Uid, body: Vec<u8>) {
        self.add_raw(
            uid,
            RawMessage {
                body,
                ..Default::default()
            },
        );
    }

    pub fn add_raw(&self, uid: Uid, raw: RawMessage) {
        self.lock().messages.insert(uid, raw);
    }

    pub fn script(&self, step: IdleStep) {
        self.lock().script.push_back(step);
    }

    /// Cancels `token` once the IDLE script has been played back, so a
    /// monitor under test shuts down by itself.
    pub fn stop_when_idle(&self, token: CancellationToken) {
        self.lock().stop_when_idle = Some(token);
    }

    pub fn set_uid_validity(&self, uid_validity: u32) {
        self.lock().uid_validity = uid_validity;
    }

    /// Kills every open connection.
    pub fn break_connections(&self) {
        self.lock().generation += 1;
    }

    pub fn refuse_connects(&self, count: usize) {
        self.lock().refuse_connects = count;
    }

    /// The next fetch of `uid` fails with a network error.
    pub fn fail_fetch_once(&self, uid: Uid) {
        self.lock().fail_fetch_once.insert(uid);
    }

    pub fn reject_commands(&self) {
        self.lock().reject_commands = true;
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn idle_count(&self) -> usize {
        self.lock().idles
    }

    pub fn fetches(&self) -> Vec<Uid> {
        self.lock().fetches.clone()
    }

    pub fn commands(&self) -> Vec<(Uid, Command)> {
        self.lock().commands.clone()
    }

    pub fn contains(&self, uid: Uid) -> bool {
        self.lock().messages.contains_key(&uid)
    }

    pub fn flags(&self, uid: Uid) -> Vec<String> {
        self.lock()
            .messages
            .get(&uid)
            .map(|raw| raw.flags.clone())
            .unwrap_or_default()
    }
}

pub struct FakeConnector {
    server: FakeServer,
}

#[async_trait]
impl Connector for FakeConnector {
    type Connection = FakeConnection;

    async fn connect(&self, credentials: &Credentials) -> Result<FakeConnection, MailError> {
        let mut state = self.server.lock();
        state.connects += 1;
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(MailError::Network("connection refused".to_string()));
        }
        if credentials.password != state.password {
            return Err(MailError::Auth("NO [AUTHENTICATIONFAILED] Invalid credentials".to_string()));
        }
        Ok(FakeConnection {
            server: self.server.clone(),
            generation: state.generation,
            spent: false,
        })
    }
}

pub struct FakeConnection {
    server: FakeServer,
    generation: u64,
    spent: bool,
}

enum IdleAction {
    Return(Result<IdleOutcome, MailError>),
    WaitForCancel,
}

impl FakeConnection {
    fn alive(&self) -> Result<MutexGuard<'_, ServerState>, MailError> {
        let state = self.server.lock();
        if self.spent || state.generation != self.generation {
            return Err(MailError::Network("connection reset by peer".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn select(&mut self, mailbox: &str) -> Result<MailboxStatus, MailError> {
        let state = self.alive()?;
        if mailbox != "INBOX" {
            return Err(MailError::Protocol(format!("NO no such mailbox {}", mailbox)));
        }
        Ok(MailboxStatus {
            exists: state.messages.len() as u32,
            uid_validity: Some(state.uid_validity),
            uid_next: state.messages.keys().next_back().map(|uid| uid + 1),
        })
    }

    async fn search_uids(&mut self, from: Uid) -> Result<Vec<Uid>, MailError> {
        let state = self.alive()?;
        let mut uids: Vec<Uid> = state.messages.range(from..).map(|(uid, _)| *uid).rev().collect();
        if uids.is_empty() {
            uids.extend(state.messages.keys().next_back().copied());
        }
        Ok(uids)
    }

    async fn highest_uid(&mut self) -> Result<Option<Uid>, MailError> {
        let state = self.alive()?;
        Ok(state.messages.keys().next_back().copied())
    }

    async fn fetch(&mut self, uid: Uid) -> Result<Option<RawMessage>, MailError> {
        let mut state = self.alive()?;
        if state.fail_fetch_once.remove(&uid) {
            state.generation += 1;
            return Err(MailError::Network("connection reset during fetch".to_string()));
        }
        state.fetches.push(uid);
        Ok(state.messages.get(&uid).cloned())
    }

    async fn idle(
        &mut self,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<IdleOutcome, MailError> {
        let action = {
            let mut state = self.alive()?;
            state.idles += 1;
            if cancel.is_cancelled() {
                IdleAction::Return(Ok(IdleOutcome::Interrupted))
            } else {
                match state.script.pop_front() {
                    Some(IdleStep::Deliver(messages)) => {
                        for (uid, body) in messages {
                            state.messages.insert(
                                uid,
                                RawMessage {
                                    body,
                                    ..Default::default()
                                },
                            );
                        }
                        IdleAction::Return(Ok(IdleOutcome::NewData))
                    }
                    Some(IdleStep::ServerEnded) => {
                        drop(state);
                        self.spent = true;
                        IdleAction::Return(Ok(IdleOutcome::ServerEnded))
                    }
                    Some(IdleStep::TimedOut) => IdleAction::Return(Ok(IdleOutcome::TimedOut)),
                    Some(IdleStep::Disconnect) => {
                        state.generation += 1;
                        IdleAction::Return(Err(MailError::Network(
                            "connection closed while idling".to_string(),
                        )))
                    }
                    None => {
                        if let Some(token) = &state.stop_when_idle {
                            token.cancel();
                        }
                        IdleAction::WaitForCancel
                    }
                }
            }
        };

        match action {
            IdleAction::Return(result) => result,
            IdleAction::WaitForCancel => {
                cancel.cancelled().await;
                Ok(IdleOutcome::Interrupted)
            }
        }
    }

    async fn execute(&mut self, uid: Uid, command: &Command) -> Result<(), MailError> {
        let mut state = self.alive()?;
        if state.reject_commands {
            return Err(MailError::Command {
                uid,
                command: command.to_string(),
                reason: "NO [TRYCREATE] no such mailbox".to_string(),
            });
        }
        match command {
            Command::Move(_) | Command::Delete => {
                state.messages.remove(&uid);
            }
            Command::SetFlag { flag, on } => {
                if let Some(raw) = state.messages.get_mut(&uid) {
                    let flag = flag.to_string();
                    raw.flags.retain(|existing| existing != &flag);
                    if *on {
                        raw.flags.push(flag);
                    }
                }
            }
        }
        state.commands.push((uid, command.clone()));
        Ok(())
    }

    async fn logout(&mut self) -> Result<(), MailError> {
        self.alive()?;
        Ok(())
    }
}

pub type Calls = Arc<Mutex<Vec<(String, Uid)>>>;

/// Filter that records every message it sees and optionally issues one
/// command for it.
pub struct RecordingFilter {
    name: String,
    calls: Calls,
    command: Option<Command>,
    break_on: Option<(Uid, FakeServer)>,
}

impl RecordingFilter {
    pub fn new(name: &str) -> (Self, Calls) {
        let calls = Calls::default();
        let filter = Self {
            name: name.to_string(),
            calls: Arc::clone(&calls),
            command: None,
            break_on: None,
        };
        (filter, calls)
    }

    pub fn with_command(mut self, command: Command) -> Self {
        self.command = Some(command);
        self
    }

    /// Kills the server's connections right before acting on `uid`.
    pub fn breaking_connection_on(mut self, uid: Uid, server: &FakeServer) -> Self {
        self.break_on = Some((uid, server.clone()));
        self
    }
}

#[async_trait]
impl Filter for RecordingFilter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn filter(
        &self,
        uid: Uid,
        _message: &Message,
        _envelope: &Envelope,
        commands: &mut dyn CommandInterface,
    ) -> Result<FilterResult, FilterError> {
        self.calls.lock().unwrap().push((self.name.clone(), uid));
        if let Some((break_uid, server)) = &self.break_on {
            if *break_uid == uid {
                server.break_connections();
            }
        }
        match &self.command {
            Some(Command::Move(folder)) => commands.move_to(folder).await?,
            Some(Command::Delete) => commands.delete().await?,
            Some(Command::SetFlag { flag, on }) => commands.set_flag(flag.clone(), *on).await?,
            None => {}
        }
        Ok(FilterResult::Continue)
    }
}

/// Server envelope for tests exercising the ENVELOPE path.
pub fn envelope(from: &str, subject: &[u8]) -> RawEnvelope {
    RawEnvelope {
        from: vec![from.to_string()],
        date: Some(b"Tue, 1 Jul 2025 10:52:37 +0200".to_vec()),
        subject: Some(subject.to_vec()),
    }
}
