//! Sentiment ordinal mapping
//!
//! Sentiment is stored and compared as a numeric ordinal 1-5 (1 = very
//! negative, 5 = very positive). Categorical comparison goes through
//! fixed thresholds, never through text pattern matching; the thresholds
//! live in a reloadable `ScoringConfig` snapshot so a side-channel config
//! update swaps them atomically for all workers.

use serde::{Deserialize, Serialize};

/// Default ordinal when the score is absent or unrecognized
pub const NEUTRAL_ORDINAL: i64 = 3;

/// Categorical sentiment derived from the ordinal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentCategory {
    Negative,
    Neutral,
    Positive,
}

impl SentimentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentCategory::Negative => "negative",
            SentimentCategory::Neutral => "neutral",
            SentimentCategory::Positive => "positive",
        }
    }
}

/// Reloadable scoring thresholds
///
/// Swapped as a whole snapshot (via a watch channel), never mutated in
/// place, so in-flight workers always see a consistent pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScoringConfig {
    /// Scores at or below this ordinal are negative
    pub negative_max: i64,
    /// Scores at or above this ordinal are positive
    pub positive_min: i64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            negative_max: 2,
            positive_min: 4,
        }
    }
}

impl ScoringConfig {
    /// Map an ordinal (or its absence) to a category
    pub fn category(&self, score: Option<i64>) -> SentimentCategory {
        match score {
            Some(s) if s <= self.negative_max => SentimentCategory::Negative,
            Some(s) if s >= self.positive_min => SentimentCategory::Positive,
            _ => SentimentCategory::Neutral,
        }
    }
}

/// Coerce whatever the ML service sent into the 1-5 ordinal
///
/// Accepts a plain number, a `{ "overall": ... }` object, or a known text
/// label. Unknown shapes and labels default to neutral rather than
/// failing the message.
pub fn coerce_ordinal(value: Option<&serde_json::Value>) -> i64 {
    let value = match value {
        Some(v) => v,
        None => return NEUTRAL_ORDINAL,
    };

    // Object form: {"overall": 4, "score": 0.8}
    if let Some(overall) = value.get("overall") {
        return coerce_ordinal(Some(overall));
    }

    if let Some(n) = value.as_i64() {
        return n.clamp(1, 5);
    }
    if let Some(f) = value.as_f64() {
        return (f.round() as i64).clamp(1, 5);
    }

    if let Some(label) = value.as_str() {
        return match label.trim().to_ascii_lowercase().as_str() {
            "positive" => 4,
            "negative" => 2,
            "neutral" | "mixed" | "unknown" => NEUTRAL_ORDINAL,
            _ => NEUTRAL_ORDINAL,
        };
    }

    NEUTRAL_ORDINAL
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn thresholds_cover_all_ordinals() {
        let cfg = ScoringConfig::default();
        assert_eq!(cfg.category(Some(1)), SentimentCategory::Negative);
        assert_eq!(cfg.category(Some(2)), SentimentCategory::Negative);
        assert_eq!(cfg.category(Some(3)), SentimentCategory::Neutral);
        assert_eq!(cfg.category(Some(4)), SentimentCategory::Positive);
        assert_eq!(cfg.category(Some(5)), SentimentCategory::Positive);
        assert_eq!(cfg.category(None), SentimentCategory::Neutral);
    }

    #[test]
    fn reloaded_thresholds_take_effect() {
        let cfg = ScoringConfig {
            negative_max: 1,
            positive_min: 3,
        };
        assert_eq!(cfg.category(Some(2)), SentimentCategory::Neutral);
        assert_eq!(cfg.category(Some(3)), SentimentCategory::Positive);
    }

    #[test]
    fn coerce_numeric_and_clamp() {
        assert_eq!(coerce_ordinal(Some(&json!(4))), 4);
        assert_eq!(coerce_ordinal(Some(&json!(9))), 5);
        assert_eq!(coerce_ordinal(Some(&json!(0))), 1);
        assert_eq!(coerce_ordinal(Some(&json!(3.6))), 4);
    }

    #[test]
    fn coerce_object_and_labels() {
        assert_eq!(coerce_ordinal(Some(&json!({"overall": 2}))), 2);
        assert_eq!(coerce_ordinal(Some(&json!("positive"))), 4);
        assert_eq!(coerce_ordinal(Some(&json!("Negative"))), 2);
        assert_eq!(coerce_ordinal(Some(&json!("mixed"))), 3);
        assert_eq!(coerce_ordinal(Some(&json!("???"))), 3);
        assert_eq!(coerce_ordinal(None), 3);
        assert_eq!(coerce_ordinal(Some(&json!([1, 2]))), 3);
    }
}
