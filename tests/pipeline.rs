//! Integration tests over the streaming output path: thinking filter →
//! tool-call filter → phrase detector → speech normalizer, composed the way
//! the turn orchestrator composes them.

use voicegate::voice::filters::{
    normalize_for_speech, strip_thinking_tags, TagFilter, ToolCallJsonFilter,
};
use voicegate::voice::phrase::PhraseDetector;

/// Run a token stream through the full filter chain and phrase detector,
/// returning the phrases that would reach TTS (post-normalization) and the
/// tool calls detected along the way.
fn run_chain(tokens: &[&str], sentence_boundary_only: bool) -> (Vec<String>, Vec<String>) {
    let mut thinking = TagFilter::thinking();
    let mut tool_filter = ToolCallJsonFilter::new();
    let mut phrases = PhraseDetector::new(sentence_boundary_only);
    let mut spoken = Vec::new();

    let mut speak = |phrase: &str, spoken: &mut Vec<String>| {
        let clean = normalize_for_speech(&strip_thinking_tags(phrase));
        if !clean.is_empty() {
            spoken.push(clean);
        }
    };

    for token in tokens {
        let filtered = thinking.filter_token(token);
        if filtered.is_empty() {
            continue;
        }
        let filtered = tool_filter.filter_token(&filtered);
        if filtered.is_empty() {
            continue;
        }
        if let Some(phrase) = phrases.add_token(&filtered) {
            speak(&phrase, &mut spoken);
        }
    }

    // Flush in orchestrator order: thinking, then tool filter, then the
    // phrase detector.
    let mut remaining = thinking.flush();
    if !remaining.is_empty() {
        remaining = tool_filter.filter_token(&remaining);
    }
    remaining.push_str(&tool_filter.flush());
    if !remaining.is_empty() {
        if let Some(phrase) = phrases.add_token(&remaining) {
            speak(&phrase, &mut spoken);
        }
    }
    if let Some(last) = phrases.flush() {
        speak(&last, &mut spoken);
    }

    let tool_calls = tool_filter.detected_tool_calls().to_vec();
    (spoken, tool_calls)
}

#[test]
fn thinking_content_never_reaches_speech() {
    let tokens = [
        "<th",
        "ink>Let me reason",
        " about this carefully.",
        "</think>",
        "The answer",
        " is four.",
    ];
    let (spoken, _) = run_chain(&tokens, true);
    assert_eq!(spoken, vec!["The answer is four."]);
    for phrase in &spoken {
        assert!(!phrase.to_lowercase().contains("think"));
        assert!(!phrase.contains("reason"));
    }
}

#[test]
fn inline_tool_call_json_is_silenced_once() {
    // Scenario: the model narrates around an inline tool-call object split
    // across many small tokens.
    let tokens = [
        "Let me check ",
        "{\"name\": ",
        "\"lookup\", ",
        "\"arguments\": ",
        "\"{\\\"q\\\":\\\"x\\\"}\"",
        "}",
        " the weather.",
    ];
    let (spoken, tool_calls) = run_chain(&tokens, true);
    assert_eq!(spoken, vec!["Let me check the weather."]);
    assert_eq!(tool_calls.len(), 1);
    assert!(tool_calls[0].contains("lookup"));
}

#[test]
fn plain_json_data_is_spoken() {
    let tokens = ["The reading is ", "{\"celsius\": 21}", ". Nice out."];
    let (spoken, tool_calls) = run_chain(&tokens, true);
    assert!(tool_calls.is_empty());
    let all = spoken.join(" ");
    assert!(all.contains("celsius"), "got: {all:?}");
}

#[test]
fn stream_text_is_preserved_modulo_phrase_edges() {
    let tokens = [
        "First sentence here. ",
        "Second one follows, with a clause. ",
        "And a trailing fragment",
    ];
    let (spoken, _) = run_chain(&tokens, true);
    let normalize = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
    assert_eq!(
        normalize(&spoken.join(" ")),
        normalize(&tokens.concat()),
    );
}

#[test]
fn aggressive_mode_splits_more_finely_but_loses_nothing() {
    let tokens = [
        "I checked the forecast, and it looks clear; ",
        "tomorrow should be sunny, with light wind. ",
    ];
    let (strong, _) = run_chain(&tokens, true);
    let (weak, _) = run_chain(&tokens, false);
    assert!(weak.len() >= strong.len());

    let normalize = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
    assert_eq!(normalize(&weak.join(" ")), normalize(&strong.join(" ")));
}

#[test]
fn thinking_only_response_produces_no_speech() {
    let tokens = ["<think>", "all internal, never spoken", "</think>"];
    let (spoken, tool_calls) = run_chain(&tokens, true);
    assert!(spoken.is_empty());
    assert!(tool_calls.is_empty());
}

#[test]
fn markdown_heavy_response_is_normalized_for_speech() {
    let tokens = [
        "**Good news!** The `deploy` finished. ",
        "See [the logs](https://ci.example.com/run/1) for details.",
    ];
    let (spoken, _) = run_chain(&tokens, true);
    assert_eq!(spoken.len(), 2);
    assert_eq!(spoken[0], "Good news! The deploy finished.");
    assert_eq!(spoken[1], "See the logs for details.");
}
