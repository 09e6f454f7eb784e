use serde::Deserialize;

fn default_target_folder() -> String {
    "Spam".to_string()
}

fn default_position_ratio() -> f64 {
    0.7
}

#[derive(Debug, Deserialize, Clone)]
pub struct SpamFilterSettings {
    #[serde(default)]
    pub enabled: bool,
    pub priority: Option<i32>,
    #[serde(default = "default_target_folder")]
    pub target_folder: String,
    #[serde(default)]
    pub from_regular_expressions: Vec<String>,
    #[serde(default)]
    pub title_regular_expressions: Vec<String>,
    #[serde(default)]
    pub body_regular_expressions: Vec<String>,
    pub trailer: Option<TrailerSettings>,
}

impl Default for SpamFilterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            priority: None,
            target_folder: default_target_folder(),
            from_regular_expressions: Vec::new(),
            title_regular_expressions: Vec::new(),
            body_regular_expressions: Vec::new(),
            trailer: None,
        }
    }
}

/// A phrase too common to trust on its own: it only counts near the end of
/// the text and together with a companion phrase ("unsubscribe").
#[derive(Debug, Deserialize, Clone)]
pub struct TrailerSettings {
    pub pattern: String,
    pub companion: String,
    /// How far into the text the tail starts, 0.0 to 1.0.
    #[serde(default = "default_position_ratio")]
    pub position_ratio: f64,
}
