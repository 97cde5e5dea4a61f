//! Streaming filters applied between the LLM token stream and TTS.
//!
//! Three concerns are kept out of the audio path: `<think>` blocks (and any
//! other tagged region), inline tool-call JSON that some models emit as
//! text, and formatting that reads fine but sounds wrong when spoken.
//! The tag and JSON filters are streaming: they accept token fragments,
//! emit token fragments, and buffer across token boundaries so a tag split
//! over two tokens is still caught.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

/// Largest phrase forwarded to TTS; excess is truncated.
pub const MAX_TTS_TEXT_LENGTH: usize = 5000;

/// Byte index at most `idx` that lands on a char boundary.
fn floor_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Streaming filter for `<name>...</name>` regions.
///
/// With `capture` set, the content inside the tags is retained and can be
/// read back afterward (used for the `<input>` echo of native-audio models);
/// otherwise it is discarded (used for `<think>`).
#[derive(Debug)]
pub struct TagFilter {
    open_tag: Regex,
    close_tag: Regex,
    capture: bool,
    in_tag: bool,
    buffer: String,
    captured: String,
    // Retained tail length, enough to catch a closing tag split across tokens.
    keep_chars: usize,
}

impl TagFilter {
    pub fn new(tag_name: &str, capture: bool) -> Self {
        let escaped = regex::escape(tag_name);
        Self {
            open_tag: Regex::new(&format!("(?i)<{escaped}>")).expect("invalid open tag pattern"),
            close_tag: Regex::new(&format!("(?i)</{escaped}>")).expect("invalid close tag pattern"),
            capture,
            in_tag: false,
            buffer: String::new(),
            captured: String::new(),
            keep_chars: tag_name.len() + 4,
        }
    }

    /// The standard thinking-tag filter.
    pub fn thinking() -> Self {
        Self::new("think", false)
    }

    /// Filter a token fragment; returns the emittable portion.
    pub fn filter_token(&mut self, token: &str) -> String {
        self.buffer.push_str(token);

        let mut result = String::new();
        loop {
            if self.in_tag {
                if let Some(m) = self.close_tag.find(&self.buffer) {
                    if self.capture {
                        self.captured.push_str(&self.buffer[..m.start()]);
                    }
                    self.in_tag = false;
                    self.buffer = self.buffer[m.end()..].to_string();
                } else {
                    // Still inside the tag: drain all but the retained tail.
                    if self.buffer.len() > self.keep_chars {
                        let cut = floor_boundary(&self.buffer, self.buffer.len() - self.keep_chars);
                        if self.capture {
                            self.captured.push_str(&self.buffer[..cut]);
                        }
                        self.buffer = self.buffer[cut..].to_string();
                    }
                    break;
                }
            } else if let Some(m) = self.open_tag.find(&self.buffer) {
                result.push_str(&self.buffer[..m.start()]);
                self.in_tag = true;
                self.buffer = self.buffer[m.end()..].to_string();
            } else {
                if self.buffer.len() > self.keep_chars {
                    let cut = floor_boundary(&self.buffer, self.buffer.len() - self.keep_chars);
                    result.push_str(&self.buffer[..cut]);
                    self.buffer = self.buffer[cut..].to_string();
                }
                break;
            }
        }

        result
    }

    /// Drain the buffer at end of stream. Content still inside an unclosed
    /// tag is captured or dropped, never emitted.
    pub fn flush(&mut self) -> String {
        if self.in_tag {
            if self.capture {
                self.captured.push_str(&self.buffer);
            }
            self.buffer.clear();
            return String::new();
        }
        std::mem::take(&mut self.buffer)
    }

    /// Captured in-tag content (only populated when `capture` is set).
    pub fn captured(&self) -> String {
        self.captured.trim().to_string()
    }
}

/// Keys whose presence marks a top-level JSON object as a tool call.
const TOOL_CALL_KEYS: &[&str] = &[
    "name",
    "function",
    "arguments",
    "tool_call",
    "tool_calls",
    "function_call",
    "type",
    "id",
    "parameters",
];

/// Streaming filter that removes inline tool-call JSON from the token
/// stream. Tracks string boundaries (with escapes) and brace/bracket depth;
/// when a top-level object or array closes it is parsed, recorded if it
/// looks like a tool call, and otherwise emitted unchanged.
#[derive(Debug, Default)]
pub struct ToolCallJsonFilter {
    buffer: String,
    in_json: bool,
    brace_depth: i32,
    bracket_depth: i32,
    in_string: bool,
    escape_next: bool,
    detected: Vec<String>,
}

impl ToolCallJsonFilter {
    pub fn new() -> Self {
        Self::default()
    }

    fn looks_like_tool_call(json_str: &str) -> bool {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(json_str) else {
            return false;
        };
        let object = match &value {
            serde_json::Value::Object(map) => Some(map),
            serde_json::Value::Array(items) => items.first().and_then(|v| v.as_object()),
            _ => None,
        };
        object
            .map(|map| TOOL_CALL_KEYS.iter().any(|k| map.contains_key(*k)))
            .unwrap_or(false)
    }

    fn push(&mut self, c: char, result: &mut String) {
        if self.in_json {
            self.buffer.push(c);
        } else {
            result.push(c);
        }
    }

    fn finish_json(&mut self, result: &mut String) {
        if Self::looks_like_tool_call(&self.buffer) {
            debug!(len = self.buffer.len(), "filtered inline tool-call JSON");
            self.detected.push(std::mem::take(&mut self.buffer));
        } else {
            result.push_str(&self.buffer);
            self.buffer.clear();
        }
        self.in_json = false;
    }

    /// Filter a token fragment; returns the emittable portion.
    pub fn filter_token(&mut self, token: &str) -> String {
        let mut result = String::new();

        for c in token.chars() {
            if self.escape_next {
                self.escape_next = false;
                self.push(c, &mut result);
                continue;
            }

            if c == '\\' && self.in_string {
                self.escape_next = true;
                self.push(c, &mut result);
                continue;
            }

            if c == '"' {
                self.in_string = !self.in_string;
                self.push(c, &mut result);
                continue;
            }

            if self.in_string {
                self.push(c, &mut result);
                continue;
            }

            match c {
                '{' => {
                    if !self.in_json && self.brace_depth == 0 && self.bracket_depth == 0 {
                        self.in_json = true;
                        self.buffer.clear();
                        self.buffer.push(c);
                        self.brace_depth = 1;
                    } else if self.in_json {
                        self.buffer.push(c);
                        self.brace_depth += 1;
                    } else {
                        result.push(c);
                    }
                }
                '}' => {
                    if self.in_json {
                        self.buffer.push(c);
                        self.brace_depth -= 1;
                        if self.brace_depth == 0 && self.bracket_depth == 0 {
                            self.finish_json(&mut result);
                        }
                    } else {
                        result.push(c);
                    }
                }
                '[' => {
                    if !self.in_json && self.brace_depth == 0 && self.bracket_depth == 0 {
                        self.in_json = true;
                        self.buffer.clear();
                        self.buffer.push(c);
                        self.bracket_depth = 1;
                    } else if self.in_json {
                        self.buffer.push(c);
                        self.bracket_depth += 1;
                    } else {
                        result.push(c);
                    }
                }
                ']' => {
                    if self.in_json {
                        self.buffer.push(c);
                        self.bracket_depth -= 1;
                        if self.brace_depth == 0 && self.bracket_depth == 0 {
                            self.finish_json(&mut result);
                        }
                    } else {
                        result.push(c);
                    }
                }
                _ => self.push(c, &mut result),
            }
        }

        result
    }

    /// Drain the buffer at end of stream. Incomplete JSON is emitted as-is;
    /// it was evidently not a well-formed tool call.
    pub fn flush(&mut self) -> String {
        self.in_json = false;
        self.brace_depth = 0;
        self.bracket_depth = 0;
        self.in_string = false;
        self.escape_next = false;
        std::mem::take(&mut self.buffer)
    }

    /// Tool-call JSON strings removed from the stream so far.
    pub fn detected_tool_calls(&self) -> &[String] {
        &self.detected
    }
}

static THINK_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<think>.*?</think>").expect("invalid think pattern"));
static THINK_ORPHAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</?think>").expect("invalid think orphan pattern"));

/// One-shot removal of thinking tags from completed text. Used for history
/// entries and as a second line of defense on phrases already past the
/// streaming filter.
pub fn strip_thinking_tags(text: &str) -> String {
    let text = THINK_BLOCK.replace_all(text, "");
    THINK_ORPHAN.replace_all(&text, "").into_owned()
}

static MD_BOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*([^*]+)\*\*").unwrap());
static MD_ITALIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*([^*]+)\*").unwrap());
static MD_UBOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"__([^_]+)__").unwrap());
static MD_UITALIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"_([^_]+)_").unwrap());
static MD_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#+\s*").unwrap());
static MD_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]+)\]\([^)]+\)").unwrap());
static MD_CODE_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"```[^`]*```").unwrap());
static MD_INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]+)`").unwrap());
static MD_BULLET: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*[-*•]\s*").unwrap());
static MD_NUMBERED: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*\d+\.\s*").unwrap());
static URLS: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://\S+").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

// Abbreviations expanded for natural speech. Contractions are deliberately
// left alone; TTS models are trained on spoken language and sound better
// with them.
static ABBREVIATIONS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"(?i)\bDr\.", "Doctor"),
        (r"(?i)\bMr\.", "Mister"),
        (r"(?i)\bMrs\.", "Misses"),
        (r"(?i)\bMs\.", "Miss"),
        (r"(?i)\bProf\.", "Professor"),
        (r"(?i)\betc\.", "etcetera"),
        (r"(?i)\be\.g\.", "for example"),
        (r"(?i)\bi\.e\.", "that is"),
        (r"(?i)\bvs\.", "versus"),
        (r"(?i)\bw/o", "without"),
        (r"(?i)\bw/", "with"),
        (r"\s&\s", " and "),
    ]
    .iter()
    .map(|(p, r)| (Regex::new(p).expect("invalid abbreviation pattern"), *r))
    .collect()
});

// Acronyms rewritten to pronounceable forms. Case-sensitive so "it" and
// "us" prose stays untouched.
static ACRONYMS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"\bAI\b", "ayeye"),
        (r"\bAPI\b", "A P I"),
        (r"\bURL\b", "U R L"),
        (r"\bSQL\b", "sequel"),
        (r"\bGUI\b", "gooey"),
        (r"\bCEO\b", "C E O"),
        (r"\bCTO\b", "C T O"),
        (r"\bVP\b", "V P"),
        (r"\bHR\b", "H R"),
        (r"\bIT\b", "I T"),
        (r"\bUI\b", "U I"),
        (r"\bUX\b", "U X"),
    ]
    .iter()
    .map(|(p, r)| (Regex::new(p).expect("invalid acronym pattern"), *r))
    .collect()
});

/// Rewrite a phrase so it sounds natural when spoken: markdown stripped,
/// abbreviations and acronyms expanded, URLs removed, whitespace collapsed.
/// Output is capped at [`MAX_TTS_TEXT_LENGTH`] characters.
pub fn normalize_for_speech(text: &str) -> String {
    let mut text = text.to_string();

    text = MD_BOLD.replace_all(&text, "$1").into_owned();
    text = MD_ITALIC.replace_all(&text, "$1").into_owned();
    text = MD_UBOLD.replace_all(&text, "$1").into_owned();
    text = MD_UITALIC.replace_all(&text, "$1").into_owned();
    text = MD_HEADER.replace_all(&text, "").into_owned();
    text = MD_LINK.replace_all(&text, "$1").into_owned();
    text = MD_CODE_BLOCK.replace_all(&text, "").into_owned();
    text = MD_INLINE_CODE.replace_all(&text, "$1").into_owned();
    text = MD_BULLET.replace_all(&text, "").into_owned();
    text = MD_NUMBERED.replace_all(&text, "").into_owned();

    for (pattern, replacement) in ABBREVIATIONS.iter() {
        text = pattern.replace_all(&text, *replacement).into_owned();
    }
    for (pattern, replacement) in ACRONYMS.iter() {
        text = pattern.replace_all(&text, *replacement).into_owned();
    }

    text = URLS.replace_all(&text, "").into_owned();
    text = WHITESPACE.replace_all(&text, " ").trim().to_string();

    if text.chars().count() > MAX_TTS_TEXT_LENGTH {
        text = text.chars().take(MAX_TTS_TEXT_LENGTH).collect();
    }

    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_tag_filter(filter: &mut TagFilter, tokens: &[&str]) -> String {
        let mut out = String::new();
        for t in tokens {
            out.push_str(&filter.filter_token(t));
        }
        out.push_str(&filter.flush());
        out
    }

    #[test]
    fn test_think_block_removed() {
        let mut f = TagFilter::thinking();
        let out = run_tag_filter(&mut f, &["Hello <think>secret plan</think>world"]);
        assert_eq!(out, "Hello world");
    }

    #[test]
    fn test_think_split_across_tokens() {
        let mut f = TagFilter::thinking();
        let out = run_tag_filter(
            &mut f,
            &["Before <th", "ink>hidden ", "reasoning</thi", "nk> after"],
        );
        assert_eq!(out, "Before  after");
        assert!(!out.contains("hidden"));
    }

    #[test]
    fn test_unclosed_think_dropped() {
        let mut f = TagFilter::thinking();
        let out = run_tag_filter(&mut f, &["Say this <think>never emit this"]);
        assert_eq!(out, "Say this ");
    }

    #[test]
    fn test_case_insensitive_tags() {
        let mut f = TagFilter::thinking();
        let out = run_tag_filter(&mut f, &["a<THINK>x</Think>b"]);
        assert_eq!(out, "ab");
    }

    #[test]
    fn test_capture_mode() {
        let mut f = TagFilter::new("input", true);
        let out = run_tag_filter(&mut f, &["Reply text <input>what I ", "heard</input> tail"]);
        assert_eq!(out, "Reply text  tail");
        assert_eq!(f.captured(), "what I heard");
    }

    #[test]
    fn test_plain_text_passes_through() {
        let mut f = TagFilter::thinking();
        let out = run_tag_filter(&mut f, &["No tags ", "here at ", "all."]);
        assert_eq!(out, "No tags here at all.");
    }

    fn run_json_filter(filter: &mut ToolCallJsonFilter, tokens: &[&str]) -> String {
        let mut out = String::new();
        for t in tokens {
            out.push_str(&filter.filter_token(t));
        }
        out.push_str(&filter.flush());
        out
    }

    #[test]
    fn test_tool_call_json_suppressed() {
        let mut f = ToolCallJsonFilter::new();
        let out = run_json_filter(
            &mut f,
            &[
                "Let me check ",
                r#"{"name": "lookup", "#,
                r#""arguments": "{\"q\":\"x\"}"}"#,
                " the weather.",
            ],
        );
        assert_eq!(out, "Let me check  the weather.");
        assert_eq!(f.detected_tool_calls().len(), 1);
        assert!(f.detected_tool_calls()[0].contains("lookup"));
    }

    #[test]
    fn test_non_tool_json_emitted() {
        let mut f = ToolCallJsonFilter::new();
        let out = run_json_filter(&mut f, &[r#"Data: {"temperature": 20, "city": "Oslo"}"#]);
        assert_eq!(out, r#"Data: {"temperature": 20, "city": "Oslo"}"#);
        assert!(f.detected_tool_calls().is_empty());
    }

    #[test]
    fn test_tool_call_array_suppressed() {
        let mut f = ToolCallJsonFilter::new();
        let out = run_json_filter(&mut f, &[r#"[{"name": "a", "arguments": "{}"}] done"#]);
        assert_eq!(out, " done");
        assert_eq!(f.detected_tool_calls().len(), 1);
    }

    #[test]
    fn test_braces_inside_strings_ignored() {
        let mut f = ToolCallJsonFilter::new();
        let input = r#"{"name": "x", "arguments": "{\"nested\": \"}\"}"} end"#;
        let out = run_json_filter(&mut f, &[input]);
        assert_eq!(out, " end");
        assert_eq!(f.detected_tool_calls().len(), 1);
    }

    #[test]
    fn test_incomplete_json_flushed_verbatim() {
        let mut f = ToolCallJsonFilter::new();
        let out = run_json_filter(&mut f, &[r#"start {"name": "never finished"#]);
        assert_eq!(out, r#"start {"name": "never finished"#);
    }

    #[test]
    fn test_strip_thinking_tags() {
        assert_eq!(
            strip_thinking_tags("a<think>hidden\nlines</think>b"),
            "ab"
        );
        assert_eq!(strip_thinking_tags("orphan</think> tail"), "orphan tail");
        assert_eq!(strip_thinking_tags("open<think> tail"), "open tail");
    }

    #[test]
    fn test_normalize_strips_markdown() {
        let out = normalize_for_speech("**Bold** and *italic* with `code` and [link](https://x.y)");
        assert_eq!(out, "Bold and italic with code and link");
    }

    #[test]
    fn test_normalize_expands_abbreviations() {
        let out = normalize_for_speech("Dr. Smith vs. Mr. Jones, etc.");
        assert_eq!(out, "Doctor Smith versus Mister Jones, etcetera");
    }

    #[test]
    fn test_normalize_expands_acronyms() {
        let out = normalize_for_speech("The AI uses an API and SQL");
        assert_eq!(out, "The ayeye uses an A P I and sequel");
    }

    #[test]
    fn test_normalize_keeps_lowercase_words() {
        // "it" must not be treated as the acronym IT
        let out = normalize_for_speech("it is what it is");
        assert_eq!(out, "it is what it is");
    }

    #[test]
    fn test_normalize_strips_urls_and_collapses_whitespace() {
        let out = normalize_for_speech("See   https://example.com/docs   for more");
        assert_eq!(out, "See for more");
    }

    #[test]
    fn test_normalize_preserves_contractions() {
        let out = normalize_for_speech("don't worry, it's fine");
        assert_eq!(out, "don't worry, it's fine");
    }

    #[test]
    fn test_normalize_caps_length() {
        let long = "word ".repeat(2000);
        assert!(normalize_for_speech(&long).chars().count() <= MAX_TTS_TEXT_LENGTH);
    }
}
