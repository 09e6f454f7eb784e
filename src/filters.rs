//! Filter chain: every new message is handed to the registered filters in
//! priority order until one of them says [`FilterResult::Stop`].

pub mod command;

use std::any::Any;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, error};
use thiserror::Error;

use crate::filters::command::CommandInterface;
use crate::mail_reader::error::MailError;
use crate::mail_reader::message::{Envelope, Message};
use crate::mail_reader::Uid;

/// Priority of filters that neither declare nor get one.
pub const DEFAULT_PRIORITY: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterResult {
    Continue,
    Stop,
}

impl From<bool> for FilterResult {
    /// `true` means the filter handled the message and the chain stops.
    fn from(stop: bool) -> Self {
        if stop {
            FilterResult::Stop
        } else {
            FilterResult::Continue
        }
    }
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error(transparent)]
    Command(#[from] MailError),

    #[error("{0}")]
    Failed(String),

    #[error("filter panicked: {0}")]
    Panicked(String),
}

/// A user supplied handler for new mail.
#[async_trait]
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    /// Priority the filter asks for; lower runs first.
    fn priority(&self) -> Option<i32> {
        None
    }

    async fn filter(
        &self,
        uid: Uid,
        message: &Message,
        envelope: &Envelope,
        commands: &mut dyn CommandInterface,
    ) -> Result<FilterResult, FilterError>;
}

#[derive(Debug)]
pub struct FilterFailure {
    pub filter: String,
    pub error: FilterError,
}

/// What happened to one message in the chain.
#[derive(Debug)]
pub struct ChainReport {
    pub result: FilterResult,
    pub stopped_by: Option<String>,
    /// Filters that ran, in order.
    pub invoked: Vec<String>,
    pub failures: Vec<FilterFailure>,
}

struct Entry {
    priority: i32,
    filter: Box<dyn Filter>,
}

#[derive(Default)]
pub struct FilterChain {
    entries: Vec<Entry>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a filter. An explicit `priority` wins over the one the filter
    /// declares; equal priorities run in registration order.
    pub fn register(&mut self, filter: Box<dyn Filter>, priority: Option<i32>) {
        let priority = priority.or(filter.priority()).unwrap_or(DEFAULT_PRIORITY);
        let position = self
            .entries
            .partition_point(|entry| entry.priority <= priority);
        debug!(
            "Registered filter {} with priority {} at position {}",
            filter.name(),
            priority,
            position
        );
        self.entries.insert(position, Entry { priority, filter });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Filter names in the order they run.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|entry| entry.filter.name()).collect()
    }

    /// Runs the chain for one message. Failing or panicking filters are
    /// recorded and count as `Continue`.
    pub async fn run(
        &self,
        uid: Uid,
        message: &Message,
        envelope: &Envelope,
        commands: &mut dyn CommandInterface,
    ) -> ChainReport {
        let mut report = ChainReport {
            result: FilterResult::Continue,
            stopped_by: None,
            invoked: Vec::new(),
            failures: Vec::new(),
        };

        for entry in &self.entries {
            let name = entry.filter.name();
            debug!("Sending message {} to {}", uid, name);
            report.invoked.push(name.to_string());

            let outcome = AssertUnwindSafe(entry.filter.filter(uid, message, envelope, &mut *commands))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(FilterError::Panicked(panic_message(panic))));

            match outcome {
                Ok(FilterResult::Stop) => {
                    debug!("Filter {} stopped the chain for message {}", name, uid);
                    report.result = FilterResult::Stop;
                    report.stopped_by = Some(name.to_string());
                    break;
                }
                Ok(FilterResult::Continue) => {}
                Err(error) => {
                    error!("Filter {} failed on message {}: {}", name, uid, error);
                    report.failures.push(FilterFailure {
                        filter: name.to_string(),
                        error,
                    });
                }
            }
        }

        report
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
