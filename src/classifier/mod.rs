//! Text classification collaborator.
//!
//! The processing loop only sees the [`Classifier`] trait. Implementations
//! must be deterministic for a given `model()` and total over their input:
//! any string, including the empty one, yields a [`Classification`].
//!
//! The `model` identifier ends up verbatim in `result_version`, so it has to
//! change whenever the scoring logic does.

pub mod lexicon;

pub use lexicon::LexiconClassifier;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ClassifierError;

/// Score at or above which text is labelled positive.
pub const POSITIVE_THRESHOLD: f64 = 0.05;
/// Score at or below which text is labelled negative.
pub const NEGATIVE_THRESHOLD: f64 = -0.05;

/// Coarse sentiment category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
}

impl SentimentLabel {
    /// Bucket a score in `[-1.0, 1.0]`.
    pub fn from_score(score: f64) -> Self {
        if score >= POSITIVE_THRESHOLD {
            Self::Positive
        } else if score <= NEGATIVE_THRESHOLD {
            Self::Negative
        } else {
            Self::Neutral
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
        }
    }
}

impl fmt::Display for SentimentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SentimentLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "positive" => Ok(Self::Positive),
            "neutral" => Ok(Self::Neutral),
            "negative" => Ok(Self::Negative),
            other => Err(format!("unknown sentiment label: {other}")),
        }
    }
}

/// Structured result written back to a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Normalised score in `[-1.0, 1.0]`.
    pub score: f64,
    pub label: SentimentLabel,
    /// Identifier of the scoring logic that produced this result.
    pub model: String,
}

impl Classification {
    /// Build a classification, deriving the label from the score.
    pub fn from_score(score: f64, model: impl Into<String>) -> Self {
        let score = score.clamp(-1.0, 1.0);
        Self {
            score,
            label: SentimentLabel::from_score(score),
            model: model.into(),
        }
    }

    /// The result for text that carries no signal.
    pub fn neutral(model: impl Into<String>) -> Self {
        Self::from_score(0.0, model)
    }
}

/// A swappable text classifier.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Identifier written to `result_version`.
    fn model(&self) -> &str;

    /// Classify one piece of text.
    async fn classify(&self, text: &str) -> Result<Classification, ClassifierError>;
}

/// Run `classifier` under a deadline.
///
/// A classifier that overruns is reported as [`ClassifierError::Timeout`] so
/// the caller can leave that record pending instead of stalling the batch.
pub async fn classify_with_timeout(
    classifier: &dyn Classifier,
    text: &str,
    timeout: Duration,
) -> Result<Classification, ClassifierError> {
    match tokio::time::timeout(timeout, classifier.classify(text)).await {
        Ok(result) => result,
        Err(_) => Err(ClassifierError::Timeout {
            model: classifier.model().to_string(),
            timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowClassifier;

    #[async_trait]
    impl Classifier for SlowClassifier {
        fn model(&self) -> &str {
            "slow-0"
        }

        async fn classify(&self, _text: &str) -> Result<Classification, ClassifierError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Classification::neutral("slow-0"))
        }
    }

    #[test]
    fn label_thresholds() {
        assert_eq!(SentimentLabel::from_score(0.05), SentimentLabel::Positive);
        assert_eq!(SentimentLabel::from_score(0.049), SentimentLabel::Neutral);
        assert_eq!(SentimentLabel::from_score(-0.049), SentimentLabel::Neutral);
        assert_eq!(SentimentLabel::from_score(-0.05), SentimentLabel::Negative);
    }

    #[test]
    fn label_round_trips_through_str() {
        for label in [
            SentimentLabel::Positive,
            SentimentLabel::Neutral,
            SentimentLabel::Negative,
        ] {
            assert_eq!(label.as_str().parse::<SentimentLabel>().unwrap(), label);
        }
        assert!("meh".parse::<SentimentLabel>().is_err());
    }

    #[test]
    fn classification_serializes_lowercase_label() {
        let c = Classification::from_score(0.5, "lexicon-0.1");
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["label"], "positive");
        assert_eq!(json["model"], "lexicon-0.1");
        assert_eq!(json["score"], 0.5);
    }

    #[test]
    fn from_score_clamps() {
        let c = Classification::from_score(3.0, "m");
        assert_eq!(c.score, 1.0);
        let c = Classification::from_score(-3.0, "m");
        assert_eq!(c.score, -1.0);
    }

    #[tokio::test]
    async fn slow_classifier_times_out() {
        let err = classify_with_timeout(&SlowClassifier, "hi", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ClassifierError::Timeout { ref model, .. } if model == "slow-0"));
    }

    #[tokio::test]
    async fn fast_classifier_passes_through() {
        let c = classify_with_timeout(&LexiconClassifier::new(), "", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(c.label, SentimentLabel::Neutral);
    }
}
