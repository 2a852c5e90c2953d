use once_cell::sync::Lazy;
use regex::Regex;

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)https?://\S+").expect("url pattern is valid"));
static MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@\w+").expect("mention pattern is valid"));
static SPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("space pattern is valid"));

/// Sanitized messages outside this character range are not learned.
pub const MIN_LEARN_CHARS: usize = 3;
pub const MAX_LEARN_CHARS: usize = 500;

/// Strips links and mentions, squeezes character floods and whitespace.
pub fn sanitize(text: &str) -> String {
    let text = URL_RE.replace_all(text, "");
    let text = MENTION_RE.replace_all(&text, "");
    let text = squeeze_repeats(&text);
    SPACE_RE.replace_all(&text, " ").trim().to_string()
}

/// Caps runs of the same character at two ("ооооо" -> "оо").
fn squeeze_repeats(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev: Option<char> = None;
    let mut run = 0;
    for c in text.chars() {
        if Some(c) == prev {
            run += 1;
        } else {
            prev = Some(c);
            run = 1;
        }
        if run <= 2 {
            out.push(c);
        }
    }
    out
}

pub fn is_learnable(clean: &str) -> bool {
    (MIN_LEARN_CHARS..=MAX_LEARN_CHARS).contains(&clean.chars().count())
}
