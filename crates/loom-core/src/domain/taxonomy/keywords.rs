//! Deterministic keyword extraction
//!
//! Lowercase alphanumeric tokens with stop words removed, ranked by
//! frequency and then by first occurrence.

use std::collections::HashMap;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "been", "but", "by", "for", "from", "had", "has",
    "have", "he", "her", "him", "his", "in", "into", "is", "it", "its", "of", "on", "or", "she",
    "that", "the", "their", "them", "they", "this", "to", "was", "were", "which", "who", "with",
];

pub fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.contains(&token.to_lowercase().as_str())
}

/// Split text into lowercase alphanumeric tokens, keeping stop words
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Tokens worth matching on: stop words and single characters removed
pub fn content_tokens(text: &str) -> Vec<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| t.chars().count() > 1 && !is_stop_word(t))
        .collect()
}

/// Extract at most `max` keywords from `text`
pub fn extract_keywords(text: &str, max: usize) -> Vec<String> {
    let tokens = content_tokens(text);
    let mut stats: HashMap<&str, (usize, usize)> = HashMap::new();
    for (position, token) in tokens.iter().enumerate() {
        stats.entry(token.as_str()).or_insert((0, position)).0 += 1;
    }

    let mut ranked: Vec<(&str, usize, usize)> = stats
        .into_iter()
        .map(|(token, (count, first))| (token, count, first))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked
        .into_iter()
        .take(max)
        .map(|(token, _, _)| token.to_string())
        .collect()
}

/// Loose token match: equal, or one a prefix of the other with at least
/// four shared characters ("organization" / "organizations")
pub fn tokens_match(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    short.len() >= 4 && long.starts_with(short)
}
