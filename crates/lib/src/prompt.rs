//! Prompt text per context label.

use crate::classifier::ContextLabel;

const START_OF_CONVERSATION: &str = "This is the start of the conversation.";

fn persona(label: ContextLabel) -> (&'static str, &'static str) {
    match label {
        ContextLabel::DailyLife => (
            "You are a kind, patient assistant helping elderly users with everyday tasks.\n\
             Refer to past chats if helpful to keep context.",
            "Response:",
        ),
        ContextLabel::HealthWellness => (
            "You are a caring and knowledgeable assistant who helps elderly users understand and manage their health and wellness.\n\
             Speak in a gentle, reassuring tone using simple, clear language.",
            "Helpful response:",
        ),
        ContextLabel::EmotionalSupport => (
            "You are a compassionate, gentle companion helping elderly users cope with emotional challenges.\n\
             Respond with kindness, empathy, and warmth.",
            "Supportive response:",
        ),
        ContextLabel::TechnologyHelp => (
            "You are a calm and patient assistant helping elderly users with technology.\n\
             Use simple words, guide step-by-step, and reassure users when things are unclear.",
            "Helpful response:",
        ),
        ContextLabel::LocalCulture => (
            "You are a warm and engaging assistant helping seniors explore their local culture.\n\
             Share relatable stories, traditions, and events in an uplifting tone.",
            "Culturally relevant response:",
        ),
        ContextLabel::GeneralConversation => (
            "You are a friendly companion having a light, natural conversation with an elderly user.\n\
             Keep it cheerful, thoughtful, and easy to follow.",
            "Chatty response:",
        ),
    }
}

/// Build the model prompt from the label, the most recent `max_history` entries and the new message.
pub fn format_prompt(label: ContextLabel, history: &[String], query: &str, max_history: usize) -> String {
    let (intro, cue) = persona(label);
    let recent = &history[history.len().saturating_sub(max_history)..];
    let history_block = if recent.is_empty() {
        START_OF_CONVERSATION.to_string()
    } else {
        format!("Recent conversation:\n{}", recent.join("\n"))
    };
    format!("{}\n\n{}\n\nUser: {}\n{}", intro, history_block, query.trim(), cue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn includes_query_and_persona() {
        let p = format_prompt(ContextLabel::HealthWellness, &[], "Help me with exercise", 4);
        assert!(p.contains("User: Help me with exercise"));
        assert!(p.starts_with("You are a caring and knowledgeable assistant"));
        assert!(p.contains(START_OF_CONVERSATION));
        assert!(p.ends_with("Helpful response:"));
    }

    #[test]
    fn keeps_only_recent_history() {
        let history: Vec<String> = (0..6).map(|i| format!("entry {}", i)).collect();
        let p = format_prompt(ContextLabel::GeneralConversation, &history, "hi", 4);
        assert!(!p.contains("entry 1"));
        assert!(p.contains("Recent conversation:\nentry 2\nentry 3\nentry 4\nentry 5"));
    }
}
