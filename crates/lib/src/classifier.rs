//! Keyword classifier: free text to a conversation context label.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Conversation topic stored per session and used to pick a prompt template.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextLabel {
    DailyLife,
    HealthWellness,
    EmotionalSupport,
    TechnologyHelp,
    LocalCulture,
    #[default]
    GeneralConversation,
}

impl ContextLabel {
    pub const ALL: [ContextLabel; 6] = [
        ContextLabel::DailyLife,
        ContextLabel::HealthWellness,
        ContextLabel::EmotionalSupport,
        ContextLabel::TechnologyHelp,
        ContextLabel::LocalCulture,
        ContextLabel::GeneralConversation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ContextLabel::DailyLife => "daily_life",
            ContextLabel::HealthWellness => "health_wellness",
            ContextLabel::EmotionalSupport => "emotional_support",
            ContextLabel::TechnologyHelp => "technology_help",
            ContextLabel::LocalCulture => "local_culture",
            ContextLabel::GeneralConversation => "general_conversation",
        }
    }
}

impl fmt::Display for ContextLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown context label: {0}")]
pub struct UnknownLabel(pub String);

impl FromStr for ContextLabel {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContextLabel::ALL
            .into_iter()
            .find(|l| l.as_str() == s.trim())
            .ok_or_else(|| UnknownLabel(s.to_string()))
    }
}

/// Trigger phrases per label. Order is significant: the first label with a
/// matching phrase wins.
const TRIGGERS: &[(ContextLabel, &[&str])] = &[
    (ContextLabel::DailyLife, &["cook", "medicine", "shopping", "weather"]),
    (
        ContextLabel::HealthWellness,
        &["exercise", "headache", "sleep", "health", "pain"],
    ),
    (
        ContextLabel::EmotionalSupport,
        &["lonely", "sad", "friends", "family", "bored"],
    ),
    (
        ContextLabel::TechnologyHelp,
        &["phone", "video call", "alarm", "scam", "slow"],
    ),
    (
        ContextLabel::LocalCulture,
        &["events", "places", "history", "tv show", "drama"],
    ),
];

/// Classify `text` by whole-word trigger matching; `GeneralConversation` when nothing matches.
pub fn classify(text: &str) -> ContextLabel {
    let lowered = text.to_lowercase();
    let words = words(&lowered);
    TRIGGERS
        .iter()
        .find(|(_, phrases)| phrases.iter().any(|p| contains_phrase(&words, p)))
        .map(|(label, _)| *label)
        .unwrap_or_default()
}

/// Split on anything that is not alphanumeric, apostrophes included.
fn words(text: &str) -> Vec<&str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect()
}

/// True when the words of `phrase` appear consecutively in `words`.
fn contains_phrase(words: &[&str], phrase: &str) -> bool {
    let needle: Vec<&str> = phrase.split_whitespace().collect();
    if needle.is_empty() || needle.len() > words.len() {
        return false;
    }
    words.windows(needle.len()).any(|w| w == needle.as_slice())
}
