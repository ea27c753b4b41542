//! Word-level timing reported with each finished sentence, and the lookups
//! that turn a playback position into highlighted text.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// How long after a word ends it still counts as the current word.
const WORD_LINGER_SECS: f64 = 0.5;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    pub word: String,
    #[serde(rename = "startTime", alias = "start_time")]
    pub start_time: f64,
    #[serde(rename = "endTime", alias = "end_time")]
    pub end_time: f64,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SentenceTiming {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub words: Vec<WordTiming>,
}

impl SentenceTiming {
    /// Parses the JSON payload of a sentence-end event.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn end_time(&self) -> Option<f64> {
        self.words.last().map(|w| w.end_time)
    }
}

/// End time of the last word of the last sentence that has words.
pub fn total_duration(timings: &[SentenceTiming]) -> Option<f64> {
    timings.iter().rev().find_map(SentenceTiming::end_time)
}

/// The word being spoken at `t` seconds.
///
/// A word whose span contains `t` wins. Otherwise the most recently finished
/// word is kept for a short while, then the next upcoming word is shown, and
/// past the end the last finished word stays highlighted.
pub fn current_word(timings: &[SentenceTiming], t: f64) -> Option<&WordTiming> {
    let words = || timings.iter().flat_map(|s| s.words.iter());

    if let Some(word) = words().find(|w| t >= w.start_time && t <= w.end_time) {
        return Some(word);
    }

    let last_finished = words().rev().find(|w| w.end_time <= t);
    if let Some(word) = last_finished {
        if t - word.end_time <= WORD_LINGER_SECS {
            return Some(word);
        }
    }

    words().find(|w| w.start_time > t).or(last_finished)
}

/// Concatenation of every word finished by `t`, in order, stopping at the
/// first word that has not finished yet.
pub fn played_text(timings: &[SentenceTiming], t: f64) -> String {
    let mut text = String::new();
    for word in timings.iter().flat_map(|s| s.words.iter()) {
        if word.end_time > t {
            break;
        }
        text.push_str(&word.word);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(text: &str, start: f64, end: f64) -> WordTiming {
        WordTiming {
            word: text.to_string(),
            start_time: start,
            end_time: end,
            confidence: 1.0,
        }
    }

    fn hello_world() -> Vec<SentenceTiming> {
        vec![SentenceTiming {
            text: "hello world".to_string(),
            words: vec![word("hello", 0.0, 0.5), word("world", 0.5, 1.0)],
        }]
    }

    #[test]
    fn parses_camel_and_snake_case() {
        let camel = br#"{"text":"hi","words":[
            {"word":"hi","startTime":0.1,"endTime":0.4,"confidence":0.9}]}"#;
        let snake = br#"{"text":"hi","words":[{"word":"hi","start_time":0.1,"end_time":0.4}]}"#;

        let a = SentenceTiming::from_payload(camel).expect("camelCase should parse");
        let b = SentenceTiming::from_payload(snake).expect("snake_case should parse");
        assert_eq!(a.words[0].end_time, 0.4);
        assert_eq!(b.words[0].start_time, 0.1);
        assert_eq!(b.words[0].confidence, 0.0);
    }

    #[test]
    fn missing_words_is_an_empty_sentence() {
        let s = SentenceTiming::from_payload(br#"{"text":"x"}"#).expect("parse");
        assert!(s.words.is_empty());
        assert_eq!(s.end_time(), None);
    }

    #[test]
    fn current_word_inside_span() {
        let timings = hello_world();
        assert_eq!(current_word(&timings, 0.2).map(|w| w.word.as_str()), Some("hello"));
        assert_eq!(current_word(&timings, 0.6).map(|w| w.word.as_str()), Some("world"));
        // Boundaries are inclusive, earliest word wins.
        assert_eq!(current_word(&timings, 0.5).map(|w| w.word.as_str()), Some("hello"));
    }

    #[test]
    fn current_word_in_gaps() {
        let timings = vec![SentenceTiming {
            text: String::new(),
            words: vec![word("a", 0.0, 0.2), word("b", 1.5, 1.8)],
        }];
        // Recently finished word lingers.
        assert_eq!(current_word(&timings, 0.6).map(|w| w.word.as_str()), Some("a"));
        // Then the upcoming word.
        assert_eq!(current_word(&timings, 1.0).map(|w| w.word.as_str()), Some("b"));
        // Before anything starts.
        assert_eq!(current_word(&timings, -0.1).map(|w| w.word.as_str()), Some("a"));
        // Long after the end.
        assert_eq!(current_word(&timings, 9.0).map(|w| w.word.as_str()), Some("b"));
        assert!(current_word(&[], 1.0).is_none());
    }

    #[test]
    fn played_text_grows_word_by_word() {
        let timings = vec![
            SentenceTiming {
                text: "你好".to_string(),
                words: vec![word("你", 0.0, 0.2), word("好", 0.2, 0.4)],
            },
            SentenceTiming {
                text: String::new(),
                words: vec![],
            },
            SentenceTiming {
                text: "世界。".to_string(),
                words: vec![word("世", 0.5, 0.7), word("界。", 0.7, 0.9)],
            },
        ];
        let all: Vec<&WordTiming> = timings.iter().flat_map(|s| s.words.iter()).collect();

        let mut expected = String::new();
        let mut previous_len = 0;
        for w in &all {
            expected.push_str(&w.word);
            let played = played_text(&timings, w.end_time);
            assert_eq!(played, expected);
            assert!(played.len() >= previous_len);
            previous_len = played.len();
        }
        assert_eq!(played_text(&timings, 0.1), "");
        assert_eq!(played_text(&timings, 0.45), "你好");
    }

    #[test]
    fn total_duration_skips_trailing_empty_sentence() {
        let mut timings = hello_world();
        timings.push(SentenceTiming::default());
        assert_eq!(total_duration(&timings), Some(1.0));
        assert_eq!(total_duration(&[]), None);
    }
}
