use anyhow::Result;
use chrono::{DateTime, Utc};

use rivulet_core::record::Review;

use crate::sentiment::Sentiment;

/// Tokens of this length or shorter are dropped.
const MIN_TERM_LEN: usize = 3;

const STOP_WORDS: [&str; 36] = [
    "the", "and", "was", "for", "with", "but", "this", "that", "have", "had", "were", "been",
    "their", "would", "there", "could", "when", "where", "what", "from", "they", "will", "just",
    "into", "your", "more", "very", "than", "then", "them", "some", "only", "also", "which",
    "about", "after",
];

fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(&word)
}

/// Split review text into terms.
///
/// Lower-cased, everything but ASCII letters and whitespace removed, then tokens of at
/// most 3 chars and stop words dropped.
pub fn tokenize(text: &str) -> Vec<String> {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphabetic() || c.is_whitespace())
        .collect();

    cleaned
        .split_whitespace()
        .filter(|w| w.len() > MIN_TERM_LEN && !is_stop_word(w))
        .map(|w| w.to_string())
        .collect()
}

/// A review with its derived features.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedReview {
    pub review_id: String,
    pub business_id: String,
    pub stars: f64,
    pub event_time: DateTime<Utc>,
    pub terms: Vec<String>,
    pub sentiment: Sentiment,
}

/// Turns log payloads into `ProcessedReview`s.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordProcessor;

impl RecordProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Decode and enrich one payload. Fails on undecodable payloads and missing timestamps.
    pub fn process(&self, data: &[u8]) -> Result<ProcessedReview> {
        let review = Review::from_bytes(data)?;
        self.process_review(review)
    }

    pub fn process_review(&self, review: Review) -> Result<ProcessedReview> {
        let event_time = review.event_time()?;

        Ok(ProcessedReview {
            terms: tokenize(&review.text),
            sentiment: Sentiment::classify(&review.text, review.stars),
            event_time,
            stars: review.stars,
            business_id: review.business_id,
            review_id: review.review_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sentiment::SentimentLabel;

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("great food"), vec!["great", "food"]);
        assert_eq!(
            tokenize("The food WAS amazing, and the staff were friendly!!! 10/10"),
            vec!["food", "amazing", "staff", "friendly"]
        );
        assert!(tokenize("this that with from after").is_empty());
        assert!(tokenize("a an the cat dog").is_empty());
    }

    #[test]
    fn test_tokenize_strips_inside_words() {
        // Apostrophes and digits are removed, not turned into separators.
        assert_eq!(tokenize("didn't r2d2 café"), vec!["didnt"]);
        assert_eq!(tokenize("naïve"), vec!["nave"]);
    }

    #[test]
    fn test_process() -> Result<()> {
        let review = Review {
            review_id: "r1".to_string(),
            text: "Delicious pasta, terrible parking".to_string(),
            stars: 2.0,
            business_id: "biz_1".to_string(),
            ..Review::default()
        }
        .stamped(Utc::now());

        let processed = RecordProcessor::new().process(&review.to_bytes()?)?;

        assert_eq!(processed.terms, vec!["delicious", "pasta", "terrible", "parking"]);
        assert_eq!(processed.sentiment.label, SentimentLabel::Negative);
        assert_eq!(processed.business_id, "biz_1");

        Ok(())
    }

    #[test]
    fn test_process_requires_timestamp() -> Result<()> {
        let review = Review {
            review_id: "r1".to_string(),
            ..Review::default()
        };

        assert!(RecordProcessor::new().process(&review.to_bytes()?).is_err());
        assert!(RecordProcessor::new().process(b"{not json").is_err());

        Ok(())
    }
}
