use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    MoveTo(String),
    Delete,
    Flag {
        flag: String,
        #[serde(default = "default_on")]
        on: bool,
    },
}

fn default_on() -> bool {
    true
}

impl Default for RuleAction {
    fn default() -> Self {
        RuleAction::MoveTo("INBOX".to_string())
    }
}

impl RuleAction {
    /// Moving or deleting takes the message away from under later filters.
    pub fn ends_chain(&self) -> bool {
        !matches!(self, RuleAction::Flag { .. })
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Rule {
    pub name: Option<String>,
    pub priority: Option<i32>,
    pub from: Option<Vec<String>>,
    pub title: Option<Vec<String>>,
    pub body: Option<Vec<String>>,
    // `action: {move_to: Spam}` reads as a one-entry map, not a YAML tag.
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub action: RuleAction,
    /// Overrides whether a match stops the chain.
    pub stop: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct RuleWrapper {
    pub rule: Rule,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct RulesConfig {
    #[serde(default)]
    pub rules: Vec<RuleWrapper>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actions(yaml: &str) -> Vec<RuleAction> {
        let config: RulesConfig = serde_yaml::from_str(yaml).unwrap();
        config.rules.into_iter().map(|wrapper| wrapper.rule.action).collect()
    }

    #[test]
    fn actions_are_written_as_maps() {
        let yaml = r#"
rules:
  - rule:
      from: ["news@example.com"]
      action:
        move_to: Newsletters
  - rule:
      title: ["urgent"]
      action: {flag: {flag: "\\Flagged"}}
  - rule:
      title: ["read"]
      action: {flag: {flag: "\\Seen", on: false}}
  - rule:
      body: ["unsubscribe"]
      action: delete
"#;

        assert_eq!(
            actions(yaml),
            vec![
                RuleAction::MoveTo("Newsletters".to_string()),
                RuleAction::Flag {
                    flag: "\\Flagged".to_string(),
                    on: true
                },
                RuleAction::Flag {
                    flag: "\\Seen".to_string(),
                    on: false
                },
                RuleAction::Delete,
            ]
        );
    }

    #[test]
    fn unknown_action_is_rejected() {
        let yaml = "rules:\n  - rule:\n      action:\n        archive: Old\n";
        assert!(serde_yaml::from_str::<RulesConfig>(yaml).is_err());
    }

    #[test]
    fn rules_serialize_back_to_the_map_form() {
        let rule = Rule {
            action: RuleAction::MoveTo("Spam".to_string()),
            ..Default::default()
        };
        let yaml = serde_yaml::to_string(&rule).unwrap();
        assert!(yaml.contains("action:\n  move_to: Spam"));
    }
}
