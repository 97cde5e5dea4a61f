//! End-of-turn arbitration with linguistic completeness analysis.
//!
//! A fixed silence threshold either cuts thinkers off mid-sentence or makes
//! every exchange sluggish. The arbiter inspects the partial transcript and
//! stretches the required silence when the user appears to be mid-thought
//! ("I need to go to ...") while keeping it tight for utterances that read
//! as finished.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

/// Assessment of whether an utterance appears complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    /// Grammatically complete, likely done.
    Complete,
    /// Trailing markers suggest more is coming.
    Incomplete,
    /// Cannot determine; use a slightly extended threshold.
    Ambiguous,
}

/// Configuration for end-of-turn detection.
#[derive(Debug, Clone, Copy)]
pub struct EndOfTurnConfig {
    /// Silence threshold for complete utterances (seconds).
    pub base_silence_duration: f32,
    /// Extended threshold while the user seems to be thinking (seconds).
    pub thinking_silence_duration: f32,
    /// Absolute ceiling; the turn always ends here (seconds).
    pub max_silence_duration: f32,
    /// Minimum speech before completeness analysis kicks in (seconds).
    pub min_speech_for_analysis: f32,
    /// Speech shorter than this counts as a "short" utterance (seconds).
    pub short_utterance_threshold: f32,
    /// Base-threshold multiplier applied to short utterances.
    pub short_utterance_silence_multiplier: f32,
    /// Turn off transcript analysis entirely (silence-only thresholds).
    pub enable_linguistic_analysis: bool,
}

impl Default for EndOfTurnConfig {
    fn default() -> Self {
        Self {
            base_silence_duration: 0.4,
            thinking_silence_duration: 1.2,
            max_silence_duration: 2.5,
            min_speech_for_analysis: 0.5,
            short_utterance_threshold: 2.0,
            short_utterance_silence_multiplier: 1.5,
            enable_linguistic_analysis: true,
        }
    }
}

// Checked FIRST: a trailing conjunction or preposition means more is coming
// even when the front of the sentence parses as a question or command.
static INCOMPLETE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Trailing conjunctions
        r"(?i)\b(and|but|or|so|because|since|although|though|while|if|when|unless|until|after|before|as|than|that|which|who|whom|whose|where)\s*$",
        // Trailing prepositions
        r"(?i)\b(to|for|with|at|by|from|in|on|of|about|into|onto|upon|through|during|without|within|between|among|under|over|after|before)\s*$",
        // Trailing articles and determiners
        r"(?i)\b(the|a|an|this|that|these|those|my|your|his|her|its|our|their|some|any|no)\s*$",
        // Trailing auxiliary verbs
        r"(?i)\b(is|are|was|were|be|been|being|have|has|had|do|does|did|will|would|shall|should|can|could|may|might|must)\s*$",
        // Hesitation fillers
        r"(?i)\b(um|uh|er|ah|like|you know|i mean|well|so|anyway|basically)\s*$",
        // Bare subject pronoun with no verb yet
        r"(?i)\b(i|you|we|they|he|she|it)\s*$",
        // List markers promising more items
        r"(?i)\b(first|second|third|one|two|three|firstly|secondly|finally|also|another)\s*$",
        // Comparative missing its completion
        r"(?i)\b(more|less|better|worse|larger|smaller|faster|slower)\s+than\s*$",
        // Unclosed quote
        r#"["'][^"']*$"#,
        // Ellipsis
        r"\.{2,}\s*$",
        // Trailing comma or colon
        r",\s*$",
        r":\s*$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid incomplete pattern"))
    .collect()
});

static COMPLETE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Sentence-ending punctuation
        r"[.!?]\s*$",
        // Common complete affirmations and negations
        r"(?i)\b(yes|no|yeah|yep|nope|okay|ok|sure|thanks|thank you|please|got it|i see|right|correct|exactly|absolutely|definitely)\s*[.!?]?\s*$",
        // Question shapes, with or without the question mark
        r"(?i)\b(what|where|when|why|how|who|which|is it|are you|can you|do you|does it|will you|would you|could you)[^.!?]*[?]?\s*$",
        // Short imperatives
        r"(?i)\b(stop|start|go|come|help|tell me|show me|give me|let me|make it|do it|try it)\b[^,]*\s*$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid complete pattern"))
    .collect()
});

static TERMINAL_PUNCT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?]$").expect("invalid terminal punct pattern"));

/// Classify a partial transcript.
///
/// Incomplete markers are checked before complete ones; the ordering is part
/// of the contract.
pub fn analyze_completeness(text: &str) -> Completeness {
    let text = text.trim();
    if text.is_empty() {
        return Completeness::Ambiguous;
    }

    for pattern in INCOMPLETE_PATTERNS.iter() {
        if pattern.is_match(text) {
            debug!("turn analysis: incomplete (trailing marker)");
            return Completeness::Incomplete;
        }
    }

    for pattern in COMPLETE_PATTERNS.iter() {
        if pattern.is_match(text) {
            debug!("turn analysis: complete");
            return Completeness::Complete;
        }
    }

    // Very short text without terminal punctuation is likely a false start.
    if text.split_whitespace().count() <= 2 && !TERMINAL_PUNCT.is_match(text) {
        debug!("turn analysis: incomplete (short, unpunctuated)");
        return Completeness::Incomplete;
    }

    debug!("turn analysis: ambiguous");
    Completeness::Ambiguous
}

/// Combines silence duration, speech duration, and transcript completeness
/// into an end-of-turn decision.
#[derive(Debug)]
pub struct EndOfTurnDetector {
    pub config: EndOfTurnConfig,
    last_completeness: Completeness,
}

impl EndOfTurnDetector {
    pub fn new(config: EndOfTurnConfig) -> Self {
        Self {
            config,
            last_completeness: Completeness::Ambiguous,
        }
    }

    /// Reset per-utterance state.
    pub fn reset(&mut self) {
        self.last_completeness = Completeness::Ambiguous;
    }

    /// Silence the user must hold before the turn ends, given context.
    pub fn required_silence(&mut self, partial_transcript: &str, speech_duration: f32) -> f32 {
        let cfg = &self.config;
        let mut base = cfg.base_silence_duration;

        // A very short utterance may just be the user getting started.
        if speech_duration < cfg.short_utterance_threshold {
            base *= cfg.short_utterance_silence_multiplier;
        }

        if !cfg.enable_linguistic_analysis || speech_duration < cfg.min_speech_for_analysis {
            return base.min(cfg.max_silence_duration);
        }

        let completeness = analyze_completeness(partial_transcript);
        self.last_completeness = completeness;

        let required = match completeness {
            Completeness::Complete => base,
            Completeness::Incomplete => cfg.thinking_silence_duration,
            Completeness::Ambiguous => base * 1.25,
        };

        required.min(cfg.max_silence_duration)
    }

    /// Whether the user's turn should end now.
    pub fn should_end_turn(
        &mut self,
        silence_duration: f32,
        speech_duration: f32,
        partial_transcript: &str,
    ) -> bool {
        // Hard ceiling: never wait forever, however incomplete the text looks.
        if silence_duration >= self.config.max_silence_duration {
            debug!(silence_duration, "end of turn: max silence reached");
            return true;
        }

        let required = self.required_silence(partial_transcript, speech_duration);
        if silence_duration >= required {
            debug!(
                silence_duration,
                required,
                completeness = ?self.last_completeness,
                "end of turn: threshold reached"
            );
            return true;
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_preposition_is_incomplete() {
        assert_eq!(analyze_completeness("I need to go to"), Completeness::Incomplete);
    }

    #[test]
    fn test_trailing_conjunction_is_incomplete() {
        assert_eq!(analyze_completeness("I want pizza and"), Completeness::Incomplete);
    }

    #[test]
    fn test_sentence_punctuation_is_complete() {
        assert_eq!(
            analyze_completeness("Turn off the lights."),
            Completeness::Complete
        );
    }

    #[test]
    fn test_question_without_mark_is_complete() {
        assert_eq!(
            analyze_completeness("what time is the meeting"),
            Completeness::Complete
        );
    }

    #[test]
    fn test_incomplete_wins_over_question_opener() {
        // Question shape, but the trailing preposition overrides it
        assert_eq!(
            analyze_completeness("what is the fastest route to"),
            Completeness::Incomplete
        );
    }

    #[test]
    fn test_trailing_comma_is_incomplete() {
        assert_eq!(analyze_completeness("first of all,"), Completeness::Incomplete);
    }

    #[test]
    fn test_short_unpunctuated_is_incomplete() {
        assert_eq!(analyze_completeness("maybe tomorrow"), Completeness::Incomplete);
    }

    #[test]
    fn test_empty_is_ambiguous() {
        assert_eq!(analyze_completeness(""), Completeness::Ambiguous);
        assert_eq!(analyze_completeness("   "), Completeness::Ambiguous);
    }

    #[test]
    fn test_incomplete_transcript_extends_silence() {
        let mut detector = EndOfTurnDetector::new(EndOfTurnConfig::default());
        let required = detector.required_silence("I need to go to", 3.0);
        assert!((required - 1.2).abs() < f32::EPSILON);

        assert!(!detector.should_end_turn(0.6, 3.0, "I need to go to"));
        assert!(detector.should_end_turn(1.2, 3.0, "I need to go to"));
    }

    #[test]
    fn test_complete_transcript_uses_base() {
        let mut detector = EndOfTurnDetector::new(EndOfTurnConfig::default());
        let required = detector.required_silence("turn off the lights.", 3.0);
        assert!((required - 0.4).abs() < f32::EPSILON);
    }

    #[test]
    fn test_short_utterance_multiplier() {
        let mut detector = EndOfTurnDetector::new(EndOfTurnConfig {
            enable_linguistic_analysis: false,
            ..EndOfTurnConfig::default()
        });
        // Speech under the short-utterance threshold: base * 1.5
        let required = detector.required_silence("hi", 1.0);
        assert!((required - 0.6).abs() < f32::EPSILON);
        // Longer speech: plain base
        let required = detector.required_silence("hello there friend", 3.0);
        assert!((required - 0.4).abs() < f32::EPSILON);
    }

    #[test]
    fn test_required_silence_never_exceeds_max() {
        let mut detector = EndOfTurnDetector::new(EndOfTurnConfig {
            thinking_silence_duration: 10.0,
            ..EndOfTurnConfig::default()
        });
        let required = detector.required_silence("I was about to", 3.0);
        assert!(required <= detector.config.max_silence_duration);
    }

    #[test]
    fn test_hard_max_forces_end() {
        let mut detector = EndOfTurnDetector::new(EndOfTurnConfig::default());
        assert!(detector.should_end_turn(2.5, 3.0, "because I wanted to"));
    }

    #[test]
    fn test_analysis_skipped_for_very_short_speech() {
        let mut detector = EndOfTurnDetector::new(EndOfTurnConfig::default());
        // Below min_speech_for_analysis the transcript is ignored; short
        // utterance multiplier still applies.
        let required = detector.required_silence("I need to go to", 0.3);
        assert!((required - 0.6).abs() < f32::EPSILON);
    }
}
