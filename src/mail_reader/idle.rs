use std::time::Duration;

use log::{debug, info};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::mail_reader::error::MailError;
use crate::mail_reader::session::{Connector, IdleOutcome, SessionHandle};
use crate::mail_reader::Uid;

/// RFC 2177 servers may drop an IDLE after 29 minutes; renew well before.
pub const DEFAULT_IDLE_RENEW: Duration = Duration::from_secs(23 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Changes {
    /// New UIDs, ascending.
    New(Vec<Uid>),
    Timeout,
    Cancelled,
}

/// Waits for new mail in the selected mailbox with IMAP IDLE.
///
/// IDLE reports sequence numbers, not UIDs, so every wake-up is followed by a
/// `UID SEARCH` for everything above the last seen UID.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    renew_interval: Duration,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_RENEW)
    }
}

impl ChangeDetector {
    pub fn new(renew_interval: Duration) -> Self {
        Self { renew_interval }
    }

    pub fn renew_interval(&self) -> Duration {
        self.renew_interval
    }

    /// Returns once there are UIDs above the session's last seen UID, the
    /// optional `timeout` ran out, or `cancel` fired.
    ///
    /// Anything that ends an IDLE without an error, including the server
    /// hanging up the IDLE on its own, just leads to the next IDLE.
    pub async fn wait_for_changes<C: Connector>(
        &self,
        session: &mut SessionHandle<C>,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Changes, MailError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            if cancel.is_cancelled() {
                return Ok(Changes::Cancelled);
            }

            let after = session.last_seen().unwrap_or(0);
            let uids = session.search_after(after).await?;
            if !uids.is_empty() {
                debug!("Found {} new message(s) above UID {}", uids.len(), after);
                return Ok(Changes::New(uids));
            }

            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(Changes::Timeout);
                    }
                    remaining.min(self.renew_interval)
                }
                None => self.renew_interval,
            };

            info!("Client is now in IDLE mode, waiting for response...");
            match session.idle(wait, cancel).await? {
                IdleOutcome::NewData => debug!("Got IDLE response, checking for new mail"),
                IdleOutcome::TimedOut => debug!("Renewing IDLE after {:?}", wait),
                IdleOutcome::ServerEnded => info!("Server ended the IDLE, renewing"),
                IdleOutcome::Interrupted => return Ok(Changes::Cancelled),
            }
        }
    }
}
