//! Phrase boundary detection over streaming LLM output.
//!
//! Tokens accumulate until a natural boundary is found, then the buffered
//! text is emitted as one phrase for TTS. Neural TTS prosody degrades on
//! mid-clause splits, so the default mode only breaks on sentence endings
//! and newlines; weak boundaries (commas, dashes, conjunctions) are opt-in
//! for lower latency at the cost of choppier speech.

use once_cell::sync::Lazy;
use regex::Regex;

// Boundary patterns, strongest first.
static SENTENCE_ENDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?](?:\s|$)").expect("invalid sentence pattern"));
static NEWLINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n").expect("invalid newline pattern"));
static CLAUSE_ENDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[;:,](?:\s|$)").expect("invalid clause pattern"));
static DASH_BREAKS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s[-–—]\s|—\S").expect("invalid dash pattern"));
static PAREN_CLOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\)(?:\s|$)").expect("invalid paren pattern"));
static CONJUNCTIONS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s(?:and|or|but|so|yet)\s").expect("invalid conjunction pattern"));

/// Accumulates tokens and emits complete phrases at natural boundaries.
///
/// The first phrase uses a lower minimum length so openers like "Sure,"
/// reach TTS immediately, minimizing time-to-first-audio.
#[derive(Debug, Clone)]
pub struct PhraseDetector {
    /// Minimum chars before a weak boundary may emit.
    pub min_phrase_length: usize,
    /// Forced-split ceiling; kept high to avoid mid-sentence breaks.
    pub max_phrase_length: usize,
    /// Alternative forced-split ceiling by word count.
    pub max_word_count: usize,
    /// Lower minimum applied until the first phrase has been emitted.
    pub first_phrase_min_length: usize,
    /// Conjunction splits only apply past this length.
    pub conjunction_min_length: usize,
    /// Split only on sentence endings and newlines.
    pub sentence_boundary_only: bool,

    buffer: String,
    first_phrase_emitted: bool,
}

impl Default for PhraseDetector {
    fn default() -> Self {
        Self {
            min_phrase_length: 12,
            max_phrase_length: 500,
            max_word_count: 80,
            first_phrase_min_length: 5,
            conjunction_min_length: 40,
            sentence_boundary_only: true,
            buffer: String::new(),
            first_phrase_emitted: false,
        }
    }
}

impl PhraseDetector {
    pub fn new(sentence_boundary_only: bool) -> Self {
        Self {
            sentence_boundary_only,
            ..Self::default()
        }
    }

    /// Clear the buffer and re-arm the first-phrase fast path.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.first_phrase_emitted = false;
    }

    fn effective_min_length(&self) -> usize {
        if self.first_phrase_emitted {
            self.min_phrase_length
        } else {
            self.first_phrase_min_length
        }
    }

    /// Take the phrase ending at byte `end`, trimming both sides.
    fn take_phrase(&mut self, end: usize) -> Option<String> {
        let phrase = self.buffer[..end].trim().to_string();
        self.buffer = self.buffer[end..].trim_start().to_string();
        if phrase.is_empty() {
            None
        } else {
            self.first_phrase_emitted = true;
            Some(phrase)
        }
    }

    /// Add a token; returns a phrase when a boundary is reached.
    pub fn add_token(&mut self, token: &str) -> Option<String> {
        self.buffer.push_str(token);

        let effective_min = self.effective_min_length();
        let buffer_len = self.buffer.trim().chars().count();
        let word_count = self.buffer.split_whitespace().count();

        // Forced split once the buffer outgrows its limits.
        if buffer_len >= self.max_phrase_length || word_count >= self.max_word_count {
            if let Some(phrase) = self.find_best_split() {
                self.first_phrase_emitted = true;
                return Some(phrase);
            }
        }

        // Sentence endings always emit.
        if let Some(m) = SENTENCE_ENDS.find(&self.buffer) {
            let end = m.end();
            if let Some(phrase) = self.take_phrase(end) {
                return Some(phrase);
            }
        }

        // Newlines emit once the minimum length is met.
        if let Some(m) = NEWLINE.find(&self.buffer) {
            if self.buffer[..m.start()].trim().chars().count() >= effective_min {
                let end = m.end();
                if let Some(phrase) = self.take_phrase(end) {
                    return Some(phrase);
                }
            }
        }

        if self.sentence_boundary_only {
            return None;
        }

        // Weak boundaries, aggressive-chunking mode only.
        if let Some(m) = CLAUSE_ENDS.find(&self.buffer) {
            if self.buffer[..m.end()].trim().chars().count() >= effective_min {
                let end = m.end();
                if let Some(phrase) = self.take_phrase(end) {
                    return Some(phrase);
                }
            }
        }

        if buffer_len >= effective_min {
            if let Some(m) = DASH_BREAKS.find(&self.buffer) {
                // Split before the dash; the dash leads the next phrase.
                let end = m.start();
                if let Some(phrase) = self.take_phrase(end) {
                    return Some(phrase);
                }
            }
        }

        if buffer_len >= effective_min {
            if let Some(m) = PAREN_CLOSE.find(&self.buffer) {
                let end = m.end();
                if let Some(phrase) = self.take_phrase(end) {
                    return Some(phrase);
                }
            }
        }

        if buffer_len >= self.conjunction_min_length {
            if let Some(m) = CONJUNCTIONS.find(&self.buffer) {
                // Keep the conjunction for the next phrase.
                let end = m.start();
                if let Some(phrase) = self.take_phrase(end) {
                    return Some(phrase);
                }
            }
        }

        None
    }

    /// Best split point once the forced-split limit is hit. Boundaries are
    /// tried strongest-first; the last resort is the midpoint word boundary,
    /// and a single unbreakable token is emitted whole.
    fn find_best_split(&mut self) -> Option<String> {
        if let Some(m) = SENTENCE_ENDS.find(&self.buffer) {
            let end = m.end();
            return self.take_phrase(end);
        }
        if let Some(m) = NEWLINE.find(&self.buffer) {
            let end = m.end();
            return self.take_phrase(end);
        }

        if !self.sentence_boundary_only {
            if let Some(m) = CLAUSE_ENDS.find(&self.buffer) {
                let end = m.end();
                return self.take_phrase(end);
            }
            if let Some(m) = DASH_BREAKS.find(&self.buffer) {
                let end = m.start();
                if let Some(phrase) = self.take_phrase(end) {
                    return Some(phrase);
                }
            }
            if let Some(m) = PAREN_CLOSE.find(&self.buffer) {
                let end = m.end();
                if let Some(phrase) = self.take_phrase(end) {
                    return Some(phrase);
                }
            }
            if let Some(m) = CONJUNCTIONS.find(&self.buffer) {
                let end = m.start();
                if let Some(phrase) = self.take_phrase(end) {
                    return Some(phrase);
                }
            }
        }

        // Midpoint word boundary.
        let words: Vec<&str> = self.buffer.split_whitespace().collect();
        if words.len() > 1 {
            let split_idx = (words.len() / 2).max(1);
            let phrase = words[..split_idx].join(" ");
            self.buffer = words[split_idx..].join(" ");
            return Some(phrase);
        }

        // Single oversized token (a URL, say): emit it whole rather than
        // letting the buffer grow without bound.
        let remaining = self.buffer.trim().to_string();
        self.buffer.clear();
        if remaining.is_empty() {
            None
        } else {
            Some(remaining)
        }
    }

    /// Emit whatever remains at end of response.
    pub fn flush(&mut self) -> Option<String> {
        let remaining = self.buffer.trim().to_string();
        self.buffer.clear();
        if remaining.is_empty() {
            None
        } else {
            Some(remaining)
        }
    }
}
