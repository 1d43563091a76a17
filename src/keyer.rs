//! Canonical keys: deterministic text buckets for fragments.
//!
//! Text is folded to a bucket by:
//! - Stripping diacritics (NFD, combining marks dropped)
//! - Lowercasing
//! - Replacing punctuation with whitespace and collapsing it
//! - Dropping articles, conjunctions and common prepositions
//! - Naive suffix singularization ("es" then "s")
//! - Joining the remaining tokens with underscores
//!
//! The key is the fast-path exact-match bucket for single fragments and the
//! grouping key of the batch dry-run.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Articles, conjunctions and common prepositions (Spanish and English).
const STOPWORDS: &[&str] = &[
    // Spanish
    "el", "la", "los", "las", "lo", "un", "una", "unos", "unas", "de", "del", "al", "a", "y",
    "e", "o", "u", "ni", "en", "con", "por", "para", "sin", "sobre", "entre", "hacia", "hasta",
    "desde", "que",
    // English
    "the", "an", "of", "and", "or", "in", "on", "at", "with", "for", "to", "from", "by",
];

/// Separator between tokens of a key.
pub const KEY_SEPARATOR: char = '_';

/// Returns true if the token is dropped from keys.
#[must_use]
pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

/// Folds text to lowercase ASCII-ish words: diacritics stripped, punctuation
/// turned into single spaces.
///
/// # Examples
///
/// ```
/// use kyronorm::keyer::fold_text;
///
/// assert_eq!(fold_text("  Atención, RÁPIDA! "), "atencion rapida");
/// ```
#[must_use]
pub fn fold_text(text: &str) -> String {
    let stripped: String = text
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect();

    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Naive suffix singularization.
///
/// Trailing "es" is dropped when the word is longer than three characters,
/// otherwise a trailing "s" is dropped when it is longer than two.
#[must_use]
pub fn singularize(token: &str) -> &str {
    let len = token.chars().count();
    if len > 3 && token.ends_with("es") {
        return &token[..token.len() - 2];
    }
    if len > 2 && token.ends_with('s') {
        return &token[..token.len() - 1];
    }
    token
}

/// Returns the key tokens of a text.
///
/// A text made only of stopwords keeps its folded words so that it still has
/// a bucket of its own.
#[must_use]
pub fn key_tokens(text: &str) -> Vec<String> {
    let folded = fold_text(text);
    let words: Vec<&str> = folded.split(' ').filter(|w| !w.is_empty()).collect();

    let content: Vec<&str> = words.iter().copied().filter(|w| !is_stopword(w)).collect();
    let kept = if content.is_empty() { words } else { content };

    kept.into_iter()
        .map(|w| singularize(w).to_string())
        .collect()
}

/// Computes the canonical key of a text. Empty text yields an empty key.
///
/// # Examples
///
/// ```
/// use kyronorm::canonical_key;
///
/// assert_eq!(canonical_key("El helado de chocolate"), "helado_chocolate");
/// assert_eq!(canonical_key("helados chocolate"), "helado_chocolate");
/// ```
#[must_use]
pub fn canonical_key(text: &str) -> String {
    let sep = KEY_SEPARATOR.to_string();
    key_tokens(text).join(&sep)
}

/// Splits a key into its tokens.
pub fn split_key(key: &str) -> impl Iterator<Item = &str> {
    key.split(KEY_SEPARATOR).filter(|t| !t.is_empty())
}

/// Stateless keyer, for call sites that take the keying step as a value.
#[derive(Debug, Default, Clone, Copy)]
pub struct CanonicalKeyer;

impl CanonicalKeyer {
    /// Computes the canonical key of a text.
    #[must_use]
    pub fn key(self, text: &str) -> String {
        canonical_key(text)
    }

    /// Returns true if two texts fall into the same bucket.
    #[must_use]
    pub fn same_bucket(self, a: &str, b: &str) -> bool {
        let ka = canonical_key(a);
        !ka.is_empty() && ka == canonical_key(b)
    }
}
