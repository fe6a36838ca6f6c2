//! Lexicon-based sentiment scorer.
//!
//! Sums per-word valences with a few contextual adjustments (negation,
//! intensifiers, "but" contrast, all-caps emphasis, exclamation marks) and
//! squashes the sum into `[-1.0, 1.0]`. Cheap, synchronous and deterministic.

use std::collections::HashMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use super::{Classification, Classifier};
use crate::error::ClassifierError;

/// Bump this whenever the lexicon or any weight below changes.
pub const LEXICON_MODEL: &str = "lexicon-0.1";

/// Normalisation constant: `sum / sqrt(sum^2 + ALPHA)`.
const ALPHA: f64 = 15.0;
const BOOSTER_INCREMENT: f64 = 0.293;
const CAPS_INCREMENT: f64 = 0.733;
const NEGATION_SCALAR: f64 = -0.74;
const EXCLAMATION_INCREMENT: f64 = 0.292;
const MAX_EXCLAMATIONS: usize = 4;
/// How many preceding tokens a negation reaches.
const NEGATION_WINDOW: usize = 3;

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}']+").expect("token regex is valid"));

static VALENCES: LazyLock<HashMap<&'static str, f64>> = LazyLock::new(|| {
    [
        ("good", 1.9),
        ("great", 3.1),
        ("excellent", 2.7),
        ("amazing", 2.8),
        ("awesome", 3.1),
        ("love", 3.2),
        ("loved", 2.9),
        ("like", 1.5),
        ("liked", 1.8),
        ("nice", 1.8),
        ("happy", 2.7),
        ("glad", 2.0),
        ("helpful", 1.8),
        ("fast", 1.2),
        ("easy", 1.9),
        ("best", 3.2),
        ("fantastic", 2.6),
        ("wonderful", 2.7),
        ("perfect", 2.7),
        ("thanks", 1.9),
        ("thank", 1.5),
        ("recommend", 1.5),
        ("pleased", 1.9),
        ("smooth", 1.1),
        ("friendly", 2.2),
        ("fine", 0.8),
        ("ok", 0.9),
        ("okay", 0.9),
        ("bad", -2.5),
        ("terrible", -2.1),
        ("awful", -2.0),
        ("horrible", -2.5),
        ("hate", -2.7),
        ("hated", -3.2),
        ("worst", -3.1),
        ("poor", -2.1),
        ("slow", -0.8),
        ("broken", -2.1),
        ("bug", -1.2),
        ("buggy", -1.9),
        ("crash", -1.7),
        ("crashes", -1.7),
        ("annoying", -1.7),
        ("angry", -2.3),
        ("sad", -2.1),
        ("disappointed", -1.9),
        ("disappointing", -2.2),
        ("useless", -1.8),
        ("confusing", -1.3),
        ("frustrating", -1.9),
        ("problem", -1.7),
        ("problems", -1.7),
        ("fail", -2.5),
        ("failed", -2.3),
        ("wrong", -2.1),
        ("rude", -2.0),
        ("expensive", -0.9),
        ("unhappy", -1.8),
        ("ugly", -2.3),
    ]
    .into_iter()
    .collect()
});

static BOOSTERS: LazyLock<HashMap<&'static str, f64>> = LazyLock::new(|| {
    [
        ("very", BOOSTER_INCREMENT),
        ("really", BOOSTER_INCREMENT),
        ("extremely", BOOSTER_INCREMENT),
        ("incredibly", BOOSTER_INCREMENT),
        ("absolutely", BOOSTER_INCREMENT),
        ("so", BOOSTER_INCREMENT),
        ("super", BOOSTER_INCREMENT),
        ("totally", BOOSTER_INCREMENT),
        ("slightly", -BOOSTER_INCREMENT),
        ("somewhat", -BOOSTER_INCREMENT),
        ("barely", -BOOSTER_INCREMENT),
        ("kinda", -BOOSTER_INCREMENT),
        ("marginally", -BOOSTER_INCREMENT),
    ]
    .into_iter()
    .collect()
});

const NEGATIONS: &[&str] = &[
    "not", "no", "never", "none", "nobody", "nothing", "neither", "nor", "cannot", "dont",
    "don't", "isn't", "isnt", "wasn't", "wasnt", "aren't", "didn't", "didnt", "doesn't",
    "doesnt", "won't", "wont", "can't", "cant", "shouldn't", "wouldn't", "couldn't", "without",
];

/// Deterministic lexicon classifier.
#[derive(Debug, Clone, Default)]
pub struct LexiconClassifier;

impl LexiconClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Score `text` synchronously. Never fails.
    pub fn score(&self, text: &str) -> Classification {
        let tokens: Vec<&str> = TOKEN_RE.find_iter(text).map(|m| m.as_str()).collect();
        if tokens.is_empty() {
            return Classification::neutral(LEXICON_MODEL);
        }

        let lowered: Vec<String> = tokens.iter().map(|t| t.to_lowercase()).collect();
        let mixed_case = tokens.iter().any(|t| is_shouting(t)) && !tokens.iter().all(|t| is_shouting(t));

        let mut valences: Vec<f64> = Vec::with_capacity(tokens.len());
        for (i, word) in lowered.iter().enumerate() {
            let Some(&base) = VALENCES.get(word.as_str()) else {
                valences.push(0.0);
                continue;
            };

            let mut valence = base;
            if mixed_case && is_shouting(tokens[i]) {
                valence += CAPS_INCREMENT * base.signum();
            }

            // Intensifiers directly in front of the word, fading with distance.
            for (distance, scale) in [(1, 1.0), (2, 0.95), (3, 0.9)] {
                if let Some(prev) = i.checked_sub(distance)
                    && let Some(&boost) = BOOSTERS.get(lowered[prev].as_str())
                {
                    valence += boost * scale * base.signum();
                }
            }

            let window_start = i.saturating_sub(NEGATION_WINDOW);
            if lowered[window_start..i]
                .iter()
                .any(|w| NEGATIONS.contains(&w.as_str()))
            {
                valence *= NEGATION_SCALAR;
            }

            valences.push(valence);
        }

        // Contrast: "but" dampens what precedes it and strengthens what follows.
        if let Some(pivot) = lowered.iter().position(|w| w == "but") {
            for (i, v) in valences.iter_mut().enumerate() {
                if i < pivot {
                    *v *= 0.5;
                } else if i > pivot {
                    *v *= 1.5;
                }
            }
        }

        let mut sum: f64 = valences.iter().sum();
        if sum != 0.0 {
            let bangs = text.matches('!').count().min(MAX_EXCLAMATIONS);
            sum += bangs as f64 * EXCLAMATION_INCREMENT * sum.signum();
        }

        Classification::from_score(round4(normalize(sum)), LEXICON_MODEL)
    }
}

#[async_trait]
impl Classifier for LexiconClassifier {
    fn model(&self) -> &str {
        LEXICON_MODEL
    }

    async fn classify(&self, text: &str) -> Result<Classification, ClassifierError> {
        Ok(self.score(text))
    }
}

fn is_shouting(token: &str) -> bool {
    token.chars().count() > 1
        && token.chars().any(char::is_alphabetic)
        && token
            .chars()
            .filter(|c| c.is_alphabetic())
            .all(char::is_uppercase)
}

fn normalize(sum: f64) -> f64 {
    (sum / (sum * sum + ALPHA).sqrt()).clamp(-1.0, 1.0)
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::SentimentLabel;

    fn score(text: &str) -> Classification {
        LexiconClassifier::new().score(text)
    }

    #[test]
    fn empty_text_is_neutral() {
        let c = score("");
        assert_eq!(c.score, 0.0);
        assert_eq!(c.label, SentimentLabel::Neutral);
        assert_eq!(c.model, LEXICON_MODEL);
    }

    #[test]
    fn garbage_is_neutral() {
        assert_eq!(score("%%% ### ;;;").label, SentimentLabel::Neutral);
        assert_eq!(score("qwxz plmk").label, SentimentLabel::Neutral);
        assert_eq!(score("!!!!").score, 0.0);
    }

    #[test]
    fn positive_and_negative() {
        assert_eq!(score("The new dashboard is great").label, SentimentLabel::Positive);
        assert_eq!(score("Checkout is broken and slow").label, SentimentLabel::Negative);
    }

    #[test]
    fn negation_flips() {
        assert_eq!(score("this is good").label, SentimentLabel::Positive);
        assert_eq!(score("this is not good").label, SentimentLabel::Negative);
    }

    #[test]
    fn boosters_intensify() {
        assert!(score("very good").score > score("good").score);
        assert!(score("slightly good").score < score("good").score);
    }

    #[test]
    fn exclamation_intensifies() {
        assert!(score("good!!!").score > score("good").score);
    }

    #[test]
    fn caps_emphasis_in_mixed_case() {
        assert!(score("this is GREAT news").score > score("this is great news").score);
    }

    #[test]
    fn but_shifts_weight_to_second_clause() {
        assert_eq!(
            score("the app is good but support was terrible").label,
            SentimentLabel::Negative
        );
    }

    #[test]
    fn score_is_bounded() {
        let c = score(&"awesome ".repeat(500));
        assert!(c.score <= 1.0 && c.score > 0.9);
        let c = score(&"worst ".repeat(500));
        assert!(c.score >= -1.0 && c.score < -0.9);
    }

    #[test]
    fn deterministic() {
        let text = "Really love the export feature, but sync is SO slow!";
        assert_eq!(score(text), score(text));
    }

    #[tokio::test]
    async fn classify_never_fails() {
        let classifier = LexiconClassifier::new();
        for text in ["", " ", "\u{0}", "日本語のテキスト", "good"] {
            assert!(classifier.classify(text).await.is_ok());
        }
    }
}
