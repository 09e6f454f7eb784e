pub mod spam_filter_settings;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use regex::{Regex, RegexBuilder};

use crate::filters::command::CommandInterface;
use crate::filters::{Filter, FilterError, FilterResult};
use crate::mail_reader::message::{Envelope, Message};
use crate::mail_reader::Uid;
use crate::spam_filter::spam_filter_settings::{SpamFilterSettings, TrailerSettings};

pub(crate) fn compile(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .multi_line(true)
        .build()
        .with_context(|| format!("invalid pattern {:?}", pattern))
}

pub(crate) fn compile_all(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns.iter().map(|pattern| compile(pattern)).collect()
}

fn match_string(string: &str, regex: &Regex) -> bool {
    let result = regex.is_match(string);
    let sanitized_string: String = string
        .chars() // Iterate over characters (not bytes)
        .take(50) // Take first 50 characters
        .filter(|c| *c != '\r' && *c != '\n') // Filter out newlines
        .collect();
    debug!("String {} pattern {} result {}", sanitized_string, regex, result);
    result
}

pub(crate) fn match_many_strings(string: &str, regexes: &[Regex]) -> bool {
    regexes.iter().any(|regex| match_string(string, regex))
}

struct Trailer {
    pattern: Regex,
    companion: Regex,
    position_ratio: f64,
}

impl Trailer {
    fn new(settings: &TrailerSettings) -> Result<Self> {
        Ok(Self {
            pattern: compile(&settings.pattern)?,
            companion: compile(&settings.companion)?,
            position_ratio: settings.position_ratio.clamp(0.0, 1.0),
        })
    }

    fn matches(&self, text: &str) -> bool {
        let chars = text.chars().count();
        let threshold = (chars as f64 * self.position_ratio) as usize;
        let start = text
            .char_indices()
            .nth(threshold)
            .map(|(index, _)| index)
            .unwrap_or(text.len());
        let tail = &text[start..];
        self.pattern.is_match(tail) && self.companion.is_match(tail)
    }
}

/// Moves mail that looks like spam into the spam folder and stops the chain.
pub struct SpamFilter {
    priority: Option<i32>,
    target_folder: String,
    from: Vec<Regex>,
    title: Vec<Regex>,
    body: Vec<Regex>,
    trailer: Option<Trailer>,
}

impl SpamFilter {
    pub fn new(settings: &SpamFilterSettings) -> Result<Self> {
        Ok(Self {
            priority: settings.priority,
            target_folder: settings.target_folder.clone(),
            from: compile_all(&settings.from_regular_expressions)?,
            title: compile_all(&settings.title_regular_expressions)?,
            body: compile_all(&settings.body_regular_expressions)?,
            trailer: settings.trailer.as_ref().map(Trailer::new).transpose()?,
        })
    }

    pub fn check_message_spam(&self, message: &Message, envelope: &Envelope) -> bool {
        // Check "from" patterns
        let from_matches = match_many_strings(envelope.sender(), &self.from);

        // Check "title" patterns
        let title_matches = match_many_strings(envelope.subject(), &self.title);

        let text = message.body_text();
        let body_matches = match_many_strings(&text, &self.body);
        let trailer_matches = self
            .trailer
            .as_ref()
            .is_some_and(|trailer| trailer.matches(&text));

        // Return true if any pattern matches (message is spam)
        from_matches || title_matches || body_matches || trailer_matches
    }
}

#[async_trait]
impl Filter for SpamFilter {
    fn name(&self) -> &str {
        "spam_filter"
    }

    fn priority(&self) -> Option<i32> {
        self.priority
    }

    async fn filter(
        &self,
        uid: Uid,
        message: &Message,
        envelope: &Envelope,
        commands: &mut dyn CommandInterface,
    ) -> Result<FilterResult, FilterError> {
        if !self.check_message_spam(message, envelope) {
            debug!(
                "did not find any matches for email with id={} and subject: {}",
                uid,
                envelope.subject()
            );
            return Ok(FilterResult::Continue);
        }

        info!(
            "The message {} is spam, moving it to {}",
            envelope.subject(),
            self.target_folder
        );
        commands.move_to(&self.target_folder).await?;
        Ok(FilterResult::Stop)
    }
}
