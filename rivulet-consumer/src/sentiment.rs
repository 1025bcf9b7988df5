//! Sentiment of a review.
//!
//! The final label is always the rating bucket. The text polarity only feeds `confidence`
//! and the text label shown next to it.

use strum::{Display, EnumString};

/// Polarity above this is positive text, below its negation negative text.
pub const TEXT_NEUTRAL_BAND: f64 = 0.1;

/// Factor applied to a polarity word right after a negator.
const NEGATION_FACTOR: f64 = -0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
}

impl SentimentLabel {
    /// All labels, in report order.
    pub const ALL: [SentimentLabel; 3] = [
        SentimentLabel::Positive,
        SentimentLabel::Neutral,
        SentimentLabel::Negative,
    ];

    /// Bucket of a star rating: up to 2 negative, exactly 3 neutral, anything else positive.
    pub fn from_stars(stars: f64) -> Self {
        if stars <= 2.0 {
            SentimentLabel::Negative
        } else if stars == 3.0 {
            SentimentLabel::Neutral
        } else {
            SentimentLabel::Positive
        }
    }

    /// Bucket of a text polarity in [-1, 1].
    pub fn from_polarity(polarity: f64) -> Self {
        if polarity > TEXT_NEUTRAL_BAND {
            SentimentLabel::Positive
        } else if polarity < -TEXT_NEUTRAL_BAND {
            SentimentLabel::Negative
        } else {
            SentimentLabel::Neutral
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sentiment {
    /// Final label, equal to `rating_label`.
    pub label: SentimentLabel,
    pub text_score: f64,
    pub rating_label: SentimentLabel,
    pub text_label: SentimentLabel,

    /// `|text_score|`.
    pub confidence: f64,
}

impl Sentiment {
    pub fn classify(text: &str, stars: f64) -> Self {
        let text_score = polarity(text);
        let rating_label = SentimentLabel::from_stars(stars);

        Self {
            label: rating_label,
            text_score,
            rating_label,
            text_label: SentimentLabel::from_polarity(text_score),
            confidence: text_score.abs(),
        }
    }
}

fn word_polarity(word: &str) -> Option<f64> {
    let score = match word {
        "excellent" | "perfect" | "best" | "delicious" | "awesome" | "wonderful" | "outstanding" => 1.0,
        "great" | "superb" | "fabulous" => 0.8,
        "good" | "tasty" | "loved" | "yummy" => 0.7,
        "amazing" | "nice" | "lovely" | "beautiful" => 0.6,
        "love" | "happy" | "recommended" => 0.5,
        "fantastic" | "fresh" | "friendly" | "clean" | "helpful" | "fun" => 0.4,
        "fine" | "decent" | "pleasant" | "cozy" => 0.3,
        "average" | "okay" | "ok" => -0.1,
        "slow" | "rude" | "expensive" | "overpriced" | "small" => -0.3,
        "poor" | "bland" | "mediocre" | "stale" => -0.4,
        "cold" | "dirty" | "disappointing" | "greasy" | "wrong" => -0.6,
        "bad" | "sad" | "gross" => -0.7,
        "disappointed" | "unacceptable" => -0.75,
        "terrible" | "awful" | "horrible" | "worst" | "disgusting" | "boring" => -1.0,
        _ => return None,
    };

    Some(score)
}

fn intensity(word: &str) -> Option<f64> {
    match word {
        "very" | "really" | "so" => Some(1.3),
        "extremely" | "incredibly" | "absolutely" | "highly" => Some(1.5),
        "slightly" | "somewhat" | "bit" => Some(0.6),
        _ => None,
    }
}

fn is_negator(word: &str) -> bool {
    matches!(
        word,
        "not" | "no" | "never" | "nothing" | "isnt" | "wasnt" | "dont" | "didnt" | "cant" | "wont"
            | "arent" | "werent" | "hardly"
    )
}

/// Text polarity in [-1, 1]: the mean score of the polarity words found.
///
/// A negator right before a polarity word (intensifiers in between allowed) flips and
/// halves it, an intensifier scales it. Text without polarity words scores 0.
pub fn polarity(text: &str) -> f64 {
    let lowered = text.to_lowercase();
    let words: Vec<String> = lowered
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|w| w.replace('\'', ""))
        .filter(|w| !w.is_empty())
        .collect();

    let mut sum = 0.0;
    let mut matched = 0;

    for (i, word) in words.iter().enumerate() {
        let mut score = match word_polarity(word) {
            Some(score) => score,
            None => continue,
        };

        let mut j = i;
        while j > 0 {
            let prev = words[j - 1].as_str();

            if let Some(factor) = intensity(prev) {
                score *= factor;
                j -= 1;
            } else {
                if is_negator(prev) {
                    score *= NEGATION_FACTOR;
                }
                break;
            }
        }

        sum += score;
        matched += 1;
    }

    if matched == 0 {
        return 0.0;
    }

    (sum / matched as f64).clamp(-1.0, 1.0)
}
