//! Persona shaping: response language (fixed or detected) and emoji
//! policy, rendered as an explicit block appended to the system prompt.

use crate::store::tenants::{EmojiPolicy, PersonaConfig};

/// High-frequency German function words. A handful of hits is a far
/// stronger signal than any single one.
const GERMAN_MARKERS: &[&str] = &[
    "der", "die", "das", "und", "ist", "ich", "nicht", "ein", "eine", "mit", "für", "auf", "wir",
    "sie", "du", "aber", "auch", "wenn", "dann", "wie", "was", "kann", "kannst", "haben", "habe",
    "sein", "bitte", "danke", "hallo", "gerne", "heute", "morgen", "schon", "noch", "mir", "mich",
];

/// Detect the response language from a user message. Three or more German
/// marker words flip to German; anything less stays English.
pub fn detect_language(text: &str) -> &'static str {
    let mut hits = 0usize;
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let lower = word.to_lowercase();
        if GERMAN_MARKERS.contains(&lower.as_str()) {
            hits += 1;
            if hits >= 3 {
                return "de";
            }
        }
    }
    "en"
}

fn language_instruction(language: &str) -> String {
    match language {
        "de" => "Respond in German.".to_string(),
        "en" => "Respond in English.".to_string(),
        other => format!("Respond in the language with code '{other}'."),
    }
}

fn emoji_instruction(policy: EmojiPolicy) -> &'static str {
    match policy {
        EmojiPolicy::None => "Do not use emojis.",
        EmojiPolicy::Minimal => "Use at most one emoji per message, only when it adds something.",
        EmojiPolicy::Moderate => "Use emojis occasionally where they fit the tone.",
        EmojiPolicy::Heavy => "Use emojis freely and expressively.",
    }
}

/// Render the persona block for one run. `auto` language resolves against
/// the triggering user message.
pub fn persona_block(persona: &PersonaConfig, user_message: &str) -> String {
    let language = if persona.language == "auto" {
        detect_language(user_message)
    } else {
        persona.language.as_str()
    };

    let mut block = String::from("## Persona\n");
    block.push_str(&language_instruction(language));
    block.push('\n');
    if let Some(ref style) = persona.style {
        block.push_str(&format!("Tone and style: {style}.\n"));
    }
    block.push_str(emoji_instruction(persona.emoji));
    block
}
