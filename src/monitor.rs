//! The agent's main loop: connect, wait for mail, run every new message
//! through the filter chain, reconnect when the connection goes away.

pub mod backoff;

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::filters::command::SessionCommands;
use crate::filters::{FilterChain, FilterResult};
use crate::mail_reader::checkpoint::{Checkpoint, CheckpointStore};
use crate::mail_reader::error::{ErrorClass, MailError};
use crate::mail_reader::idle::{ChangeDetector, Changes};
use crate::mail_reader::message::MessageLoader;
use crate::mail_reader::session::{Connector, MailboxStatus, SessionHandle};
use crate::mail_reader::Uid;
use crate::monitor::backoff::Backoff;
use crate::settings::MonitorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Connecting,
    Waiting,
    Processing,
    Reconnecting,
    ShuttingDown,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Resume after the checkpointed UID on startup instead of the newest
    /// message.
    pub catchup: bool,
    pub checkpoints: Option<CheckpointStore>,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(5 * 60),
            catchup: false,
            checkpoints: None,
        }
    }
}

impl From<&MonitorConfig> for MonitorOptions {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            backoff_initial: Duration::from_secs(config.backoff_initial_seconds),
            backoff_max: Duration::from_secs(config.backoff_max_seconds),
            catchup: config.catchup,
            checkpoints: Some(CheckpointStore::new(config.state_file.clone())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub handled: usize,
    pub skipped: usize,
    pub stopped: usize,
    pub filter_failures: usize,
    pub reconnects: usize,
}

pub struct Monitor<C: Connector> {
    session: SessionHandle<C>,
    detector: ChangeDetector,
    loader: MessageLoader,
    chain: FilterChain,
    options: MonitorOptions,
    backoff: Backoff,
    cancel: CancellationToken,
    state: MonitorState,
    pending: VecDeque<Uid>,
    uid_validity: Option<u32>,
    fatal: Option<MailError>,
    stats: MonitorStats,
}

impl<C: Connector> Monitor<C> {
    pub fn new(
        session: SessionHandle<C>,
        detector: ChangeDetector,
        chain: FilterChain,
        options: MonitorOptions,
        cancel: CancellationToken,
    ) -> Self {
        let backoff = Backoff::new(options.backoff_initial, options.backoff_max);
        Self {
            session,
            detector,
            loader: MessageLoader,
            chain,
            options,
            backoff,
            cancel,
            state: MonitorState::Connecting,
            pending: VecDeque::new(),
            uid_validity: None,
            fatal: None,
            stats: MonitorStats::default(),
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn stats(&self) -> MonitorStats {
        self.stats
    }

    pub fn session(&self) -> &SessionHandle<C> {
        &self.session
    }

    /// Runs until cancelled or until a fatal error. Returns `Ok` on a normal
    /// shutdown and the fatal error otherwise; the session is logged out in
    /// both cases.
    pub async fn run(&mut self) -> Result<(), MailError> {
        info!("Monitoring {} with {} filter(s)", self.session.mailbox(), self.chain.len());

        loop {
            if self.cancel.is_cancelled() && self.state != MonitorState::ShuttingDown {
                self.transition(MonitorState::ShuttingDown);
            }

            let next = match self.state {
                MonitorState::Connecting => match self.establish().await {
                    Ok(()) => {
                        self.backoff.reset();
                        MonitorState::Waiting
                    }
                    Err(e) => self.on_error(e),
                },
                MonitorState::Waiting => {
                    let changes = self
                        .detector
                        .wait_for_changes(&mut self.session, None, &self.cancel)
                        .await;
                    match changes {
                        Ok(Changes::New(uids)) => {
                            self.pending = uids.into();
                            MonitorState::Processing
                        }
                        Ok(Changes::Timeout) => MonitorState::Waiting,
                        Ok(Changes::Cancelled) => MonitorState::ShuttingDown,
                        Err(e) => self.on_error(e),
                    }
                }
                MonitorState::Processing => match self.process_pending().await {
                    Ok(()) => MonitorState::Waiting,
                    Err(e) => {
                        // Whatever is left gets found again after reconnecting.
                        self.pending.clear();
                        self.on_error(e)
                    }
                },
                MonitorState::Reconnecting => {
                    let delay = self.backoff.next_delay();
                    info!("Reconnecting in {:?}", delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => MonitorState::Connecting,
                        _ = self.cancel.cancelled() => MonitorState::ShuttingDown,
                    }
                }
                MonitorState::ShuttingDown => {
                    self.session.close().await;
                    info!(
                        "Monitor stopped: {} handled, {} skipped, {} reconnect(s)",
                        self.stats.handled, self.stats.skipped, self.stats.reconnects
                    );
                    return match self.fatal.take() {
                        Some(e) => Err(e),
                        None => Ok(()),
                    };
                }
            };

            self.transition(next);
        }
    }

    fn transition(&mut self, next: MonitorState) {
        if next != self.state {
            debug!("Monitor {} -> {}", self.state, next);
            self.state = next;
        }
    }

    fn on_error(&mut self, e: MailError) -> MonitorState {
        if e.is_fatal() {
            error!("Giving up: {}", e);
            self.fatal = Some(e);
            MonitorState::ShuttingDown
        } else {
            warn!("{}", e);
            self.stats.reconnects += 1;
            MonitorState::Reconnecting
        }
    }

    async fn establish(&mut self) -> Result<(), MailError> {
        let status = self.session.reconnect().await?;
        self.establish_baseline(status).await
    }

    /// Decides the UID above which mail counts as new.
    async fn establish_baseline(&mut self, status: MailboxStatus) -> Result<(), MailError> {
        let first_connect = self.session.last_seen().is_none();

        if !first_connect {
            if status.uid_validity == self.uid_validity {
                debug!("Resuming after UID {:?}", self.session.last_seen());
                return Ok(());
            }
            warn!(
                "UIDVALIDITY of {} changed from {:?} to {:?}, starting over from the newest message",
                self.session.mailbox(),
                self.uid_validity,
                status.uid_validity
            );
        }

        let resumed = if first_connect && self.options.catchup {
            self.load_checkpoint(status.uid_validity).await
        } else {
            None
        };

        let baseline = match resumed {
            Some(uid) => {
                info!("Catching up on messages after UID {}", uid);
                uid
            }
            None => {
                debug!("Searching for most recent email");
                self.session.highest_uid().await?.unwrap_or(0)
            }
        };

        self.uid_validity = status.uid_validity;
        self.session.set_last_seen(baseline);
        self.save_checkpoint(baseline).await;
        Ok(())
    }

    async fn load_checkpoint(&self, uid_validity: Option<u32>) -> Option<Uid> {
        let store = self.options.checkpoints.as_ref()?;
        match store.load().await {
            Ok(Some(checkpoint)) => {
                if checkpoint.uid_validity.is_none() || checkpoint.uid_validity == uid_validity {
                    Some(checkpoint.last_seen_uid)
                } else {
                    info!("Checkpoint belongs to another UIDVALIDITY, not catching up");
                    None
                }
            }
            Ok(None) => {
                debug!("Tried to catch up, but {} doesn't exist", store.path().display());
                None
            }
            Err(e) => {
                warn!("Ignoring unreadable checkpoint: {:#}", e);
                None
            }
        }
    }

    async fn save_checkpoint(&self, uid: Uid) {
        if let Some(store) = &self.options.checkpoints {
            let checkpoint = Checkpoint {
                uid_validity: self.uid_validity,
                last_seen_uid: uid,
            };
            if let Err(e) = store.save(&checkpoint).await {
                warn!("Could not save checkpoint: {:#}", e);
            }
        }
    }

    /// Works through the batch oldest first. Stops early on cancellation; the
    /// unhandled rest is picked up by the next run.
    async fn process_pending(&mut self) -> Result<(), MailError> {
        while let Some(uid) = self.pending.pop_front() {
            if self.cancel.is_cancelled() {
                self.pending.clear();
                break;
            }
            if self.session.last_seen().is_some_and(|seen| uid <= seen) {
                continue;
            }
            self.handle_message(uid).await?;
        }
        Ok(())
    }

    async fn handle_message(&mut self, uid: Uid) -> Result<(), MailError> {
        match self.loader.load(&mut self.session, uid).await {
            Ok(message) => {
                let report = {
                    let mut commands = SessionCommands::new(&mut self.session, uid);
                    self.chain
                        .run(uid, &message, message.envelope(), &mut commands)
                        .await
                };

                self.stats.filter_failures += report.failures.len();
                if report.result == FilterResult::Stop {
                    self.stats.stopped += 1;
                }
                debug!(
                    "Message {} went through {:?}, stopped by {:?}",
                    uid, report.invoked, report.stopped_by
                );
                self.stats.handled += 1;
            }
            Err(e) if e.class() == ErrorClass::Message => {
                warn!("Skipping message {}: {}", uid, e);
                self.stats.skipped += 1;
            }
            Err(e) => return Err(e),
        }

        self.session.set_last_seen(uid);
        self.save_checkpoint(uid).await;

        // A filter command may have hit a dead connection.
        if !self.session.is_selected() {
            return Err(MailError::Network(format!(
                "connection lost while filtering message {}",
                uid
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::mail_reader::session::Command;
    use crate::testing::{credentials, mail, FakeConnector, FakeServer, IdleStep, RecordingFilter};

    fn options() -> MonitorOptions {
        MonitorOptions {
            backoff_initial: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn monitor(
        server: &FakeServer,
        password: &str,
        chain: FilterChain,
        options: MonitorOptions,
    ) -> Monitor<FakeConnector> {
        let cancel = CancellationToken::new();
        server.stop_when_idle(cancel.clone());
        let session = SessionHandle::new(server.connector(), Arc::new(credentials(password)), "INBOX");
        Monitor::new(session, ChangeDetector::default(), chain, options, cancel)
    }

    #[tokio::test]
    async fn existing_mail_is_left_alone() {
        let server = FakeServer::new("pw");
        server.add_message(100, mail("a@example.com", "old", "x"));
        let (filter, calls) = RecordingFilter::new("A");
        let mut chain = FilterChain::new();
        chain.register(Box::new(filter), None);

        let mut monitor = monitor(&server, "pw", chain, options());
        monitor.run().await.unwrap();

        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(monitor.session().last_seen(), Some(100));
        assert_eq!(monitor.state(), MonitorState::ShuttingDown);
    }

    #[tokio::test]
    async fn wrong_password_shuts_down_without_retrying() {
        let server = FakeServer::new("right");
        let mut monitor = monitor(&server, "wrong", FilterChain::new(), options());

        let err = monitor.run().await.unwrap_err();

        assert!(matches!(err, MailError::Auth(_)));
        assert_eq!(server.connect_count(), 1);
        assert_eq!(monitor.stats().reconnects, 0);
        assert_eq!(monitor.state(), MonitorState::ShuttingDown);
    }

    #[tokio::test]
    async fn unreachable_server_is_retried_until_it_answers() {
        let server = FakeServer::new("pw");
        server.refuse_connects(3);
        server.script(IdleStep::Deliver(vec![(1, mail("a@example.com", "s", "x"))]));
        let (filter, calls) = RecordingFilter::new("A");
        let mut chain = FilterChain::new();
        chain.register(Box::new(filter), None);

        let mut monitor = monitor(&server, "pw", chain, options());
        monitor.run().await.unwrap();

        assert_eq!(server.connect_count(), 4);
        assert_eq!(monitor.stats().reconnects, 3);
        assert_eq!(*calls.lock().unwrap(), vec![("A".to_string(), 1)]);
    }

    #[tokio::test]
    async fn server_ended_idle_keeps_monitoring() {
        let server = FakeServer::new("pw");
        server.script(IdleStep::ServerEnded);
        server.script(IdleStep::Deliver(vec![(1, mail("a@example.com", "s", "x"))]));
        let (filter, calls) = RecordingFilter::new("A");
        let mut chain = FilterChain::new();
        chain.register(Box::new(filter), None);

        let mut monitor = monitor(&server, "pw", chain, options());
        monitor.run().await.unwrap();

        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(server.connect_count(), 2);
        assert_eq!(monitor.stats().reconnects, 0);
    }

    #[tokio::test]
    async fn disconnect_while_idle_resumes_without_reprocessing() {
        let server = FakeServer::new("pw");
        server.script(IdleStep::Deliver(vec![(101, mail("a@example.com", "one", "x"))]));
        server.script(IdleStep::Disconnect);
        server.script(IdleStep::Deliver(vec![(102, mail("a@example.com", "two", "x"))]));
        let (filter, calls) = RecordingFilter::new("A");
        let mut chain = FilterChain::new();
        chain.register(Box::new(filter), None);

        let mut monitor = monitor(&server, "pw", chain, options());
        monitor.run().await.unwrap();

        assert_eq!(server.connect_count(), 2);
        assert_eq!(server.fetches(), vec![101, 102]);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![("A".to_string(), 101), ("A".to_string(), 102)]
        );
    }

    #[tokio::test]
    async fn fetch_failure_mid_batch_refetches_only_unhandled_messages() {
        let server = FakeServer::new("pw");
        server.fail_fetch_once(102);
        server.script(IdleStep::Deliver(vec![
            (101, mail("a@example.com", "one", "x")),
            (102, mail("a@example.com", "two", "x")),
            (103, mail("a@example.com", "three", "x")),
        ]));
        let (filter, calls) = RecordingFilter::new("A");
        let mut chain = FilterChain::new();
        chain.register(Box::new(filter), None);

        let mut monitor = monitor(&server, "pw", chain, options());
        monitor.run().await.unwrap();

        assert_eq!(server.fetches(), vec![101, 102, 103]);
        let uids: Vec<Uid> = calls.lock().unwrap().iter().map(|(_, uid)| *uid).collect();
        assert_eq!(uids, vec![101, 102, 103]);
        assert_eq!(monitor.stats().handled, 3);
        assert_eq!(monitor.stats().reconnects, 1);
    }

    #[tokio::test]
    async fn command_on_a_dead_connection_triggers_reconnect() {
        let server = FakeServer::new("pw");
        server.script(IdleStep::Deliver(vec![(101, mail("a@example.com", "one", "x"))]));
        server.script(IdleStep::Deliver(vec![(102, mail("a@example.com", "two", "x"))]));
        let (filter, calls) = RecordingFilter::new("mover");
        let filter = filter
            .with_command(Command::Move("Archive".to_string()))
            .breaking_connection_on(101, &server);
        let mut chain = FilterChain::new();
        chain.register(Box::new(filter), None);

        let mut monitor = monitor(&server, "pw", chain, options());
        monitor.run().await.unwrap();

        // 101 was handled (its move failed) and is not retried.
        let uids: Vec<Uid> = calls.lock().unwrap().iter().map(|(_, uid)| *uid).collect();
        assert_eq!(uids, vec![101, 102]);
        assert_eq!(monitor.stats().filter_failures, 1);
        assert_eq!(server.connect_count(), 2);
        assert!(server.contains(101));
        assert!(!server.contains(102));
    }

    #[tokio::test]
    async fn vanished_message_is_skipped() {
        let server = FakeServer::new("pw");
        server.script(IdleStep::Deliver(vec![(5, Vec::new())]));
        let (filter, calls) = RecordingFilter::new("A");
        let mut chain = FilterChain::new();
        chain.register(Box::new(filter), None);

        let mut monitor = monitor(&server, "pw", chain, options());
        monitor.run().await.unwrap();

        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(monitor.stats().skipped, 1);
        assert_eq!(monitor.session().last_seen(), Some(5));
    }

    #[tokio::test]
    async fn catchup_resumes_after_the_checkpoint() {
        let server = FakeServer::new("pw");
        for uid in 100..=103 {
            server.add_message(uid, mail("a@example.com", "queued", "x"));
        }
        let path = std::env::temp_dir().join(format!("mailsift-monitor-{}.json", std::process::id()));
        let store = CheckpointStore::new(&path);
        store
            .save(&Checkpoint {
                uid_validity: Some(1),
                last_seen_uid: 101,
            })
            .await
            .unwrap();

        let (filter, calls) = RecordingFilter::new("A");
        let mut chain = FilterChain::new();
        chain.register(Box::new(filter), None);
        let options = MonitorOptions {
            catchup: true,
            checkpoints: Some(store.clone()),
            ..options()
        };

        let mut monitor = monitor(&server, "pw", chain, options);
        monitor.run().await.unwrap();

        let uids: Vec<Uid> = calls.lock().unwrap().iter().map(|(_, uid)| *uid).collect();
        assert_eq!(uids, vec![102, 103]);
        assert_eq!(store.load().await.unwrap().unwrap().last_seen_uid, 103);
        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn checkpoint_from_another_uid_validity_is_ignored() {
        let server = FakeServer::new("pw");
        server.set_uid_validity(7);
        server.add_message(100, mail("a@example.com", "old", "x"));
        let path = std::env::temp_dir().join(format!("mailsift-validity-{}.json", std::process::id()));
        let store = CheckpointStore::new(&path);
        store
            .save(&Checkpoint {
                uid_validity: Some(1),
                last_seen_uid: 10,
            })
            .await
            .unwrap();

        let (filter, calls) = RecordingFilter::new("A");
        let mut chain = FilterChain::new();
        chain.register(Box::new(filter), None);
        let options = MonitorOptions {
            catchup: true,
            checkpoints: Some(store),
            ..options()
        };

        let mut monitor = monitor(&server, "pw", chain, options);
        monitor.run().await.unwrap();

        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(monitor.session().last_seen(), Some(100));
        std::fs::remove_file(path).unwrap();
    }
}
