use once_cell::sync::Lazy;
use regex::Regex;

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\w+|[.,!?;:]").expect("token pattern is valid"));

/// Punctuation marks that are emitted as standalone tokens.
pub const PUNCTUATION: [&str; 6] = [".", ",", "!", "?", ";", ":"];

pub fn is_punctuation(token: &str) -> bool {
    PUNCTUATION.contains(&token)
}

/// Splits text into word runs and single punctuation marks.
pub fn tokenize(text: &str, normalize_lower: bool) -> Vec<String> {
    TOKEN_RE
        .find_iter(text)
        .map(|m| {
            if normalize_lower {
                m.as_str().to_lowercase()
            } else {
                m.as_str().to_string()
            }
        })
        .collect()
}

/// Joins tokens back into prose and cuts the result to `max_chars` characters.
///
/// Punctuation attaches to the preceding token. The cut is a plain character
/// slice followed by trimming trailing whitespace.
pub fn detokenize<S: AsRef<str>>(tokens: &[S], max_chars: usize) -> String {
    let mut text = String::new();
    for token in tokens {
        let token = token.as_ref();
        if !text.is_empty() && !is_punctuation(token) {
            text.push(' ');
        }
        text.push_str(token);
    }

    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    cut.trim_end().to_string()
}
