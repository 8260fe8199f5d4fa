//! Flair choice and modal confirmation rules

/// Generic flairs in order of preference
const GENERIC_FLAIRS: &[&str] = &[
    "general",
    "discussion",
    "other",
    "misc",
    "oc",
    "original content",
    "photo",
    "image",
];

/// Flairs reserved for moderators or special posts
const RESERVED_WORDS: &[&str] = &["mod", "moderator", "announcement", "meta", "verified", "verification"];

/// Labels that close a modal without applying it
const DISMISS_WORDS: &[&str] = &["close", "cancel", "dismiss", "discard", "back", "x", "×"];

fn tokens(label: &str) -> Vec<String> {
    label
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

fn matches_phrase(label: &str, phrase: &str) -> bool {
    let label_tokens = tokens(label);
    let phrase_tokens = tokens(phrase);
    if phrase_tokens.is_empty() {
        return false;
    }
    label_tokens
        .windows(phrase_tokens.len())
        .any(|w| w == phrase_tokens.as_slice())
}

pub fn is_reserved(label: &str) -> bool {
    RESERVED_WORDS.iter().any(|w| matches_phrase(label, w))
}

/// Index of the safest generic option, if one is recognised
pub fn choose_generic_flair(options: &[String]) -> Option<usize> {
    GENERIC_FLAIRS.iter().find_map(|preferred| {
        options
            .iter()
            .position(|o| matches_phrase(o, preferred) && !is_reserved(o))
    })
}

/// First option that is not reserved, used when nothing generic exists
pub fn first_unreserved(options: &[String]) -> Option<usize> {
    options.iter().position(|o| !o.trim().is_empty() && !is_reserved(o))
}

/// Whether clicking an element labelled `label` would dismiss a modal
pub fn is_dismissal(label: &str) -> bool {
    let label = label.trim().to_lowercase();
    if label.is_empty() {
        // Icon-only buttons in a dialog header are close buttons
        return true;
    }
    DISMISS_WORDS.iter().any(|w| label == *w || label.starts_with(&format!("{} ", w)))
}
