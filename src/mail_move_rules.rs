pub mod mail_move_settings;

use anyhow::Result;
use async_trait::async_trait;
use log::info;
use regex::Regex;

use crate::filters::command::CommandInterface;
use crate::filters::{Filter, FilterError, FilterResult};
use crate::mail_move_rules::mail_move_settings::{Rule, RuleAction, RulesConfig};
use crate::mail_reader::message::{Envelope, Message};
use crate::mail_reader::session::Flag;
use crate::mail_reader::Uid;
use crate::spam_filter::{compile_all, match_many_strings};

/// One configured rule, run as a filter of its own.
pub struct MoveRule {
    name: String,
    priority: Option<i32>,
    from: Vec<Regex>,
    title: Vec<Regex>,
    body: Vec<Regex>,
    action: RuleAction,
    stop: bool,
}

fn describe(action: &RuleAction) -> String {
    match action {
        RuleAction::MoveTo(folder) => format!("move_to:{}", folder),
        RuleAction::Delete => "delete".to_string(),
        RuleAction::Flag { flag, on } => format!("flag:{}:{}", flag, on),
    }
}

impl MoveRule {
    pub fn new(rule: &Rule, index: usize) -> Result<Self> {
        let compile = |patterns: &Option<Vec<String>>| match patterns {
            Some(patterns) => compile_all(patterns),
            None => Ok(Vec::new()),
        };

        Ok(Self {
            name: rule
                .name
                .clone()
                .unwrap_or_else(|| format!("rule {} ({})", index + 1, describe(&rule.action))),
            priority: rule.priority,
            from: compile(&rule.from)?,
            title: compile(&rule.title)?,
            body: compile(&rule.body)?,
            action: rule.action.clone(),
            stop: rule.stop.unwrap_or_else(|| rule.action.ends_chain()),
        })
    }

    /// Any matching from, title or body pattern fires the rule.
    pub fn check_message_matches(&self, message: &Message, envelope: &Envelope) -> bool {
        match_many_strings(envelope.sender(), &self.from)
            || match_many_strings(envelope.subject(), &self.title)
            || (!self.body.is_empty() && match_many_strings(&message.body_text(), &self.body))
    }
}

/// Builds one filter per configured rule, in file order.
pub fn build_rules(config: &RulesConfig) -> Result<Vec<MoveRule>> {
    config
        .rules
        .iter()
        .enumerate()
        .map(|(index, wrapper)| MoveRule::new(&wrapper.rule, index))
        .collect()
}

#[async_trait]
impl Filter for MoveRule {
    fn name(&self) -> &str {
        &self.name
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
        if !self.check_message_matches(message, envelope) {
            return Ok(FilterResult::Continue);
        }

        info!("The message {:?} ({}) matches {}", envelope.subject(), uid, self.name);
        match &self.action {
            RuleAction::MoveTo(folder) => commands.move_to(folder).await?,
            RuleAction::Delete => commands.delete().await?,
            RuleAction::Flag { flag, on } => commands.set_flag(Flag::parse(flag), *on).await?,
        }

        Ok(self.stop.into())
    }
}
