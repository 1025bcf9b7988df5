use chrono::{DateTime, Utc};
use hashbrown::HashMap;

use crate::sentiment::SentimentLabel;
use crate::window_store::WindowState;

/// Read-only view of the analytics at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSnapshot {
    pub taken_at: DateTime<Utc>,

    /// Lifetime.
    pub total_reviews: u64,
    pub avg_review_length: f64,
    pub rating_distribution: Vec<(i64, u64)>,
    pub sentiment_distribution: Vec<(SentimentLabel, u64)>,
    pub lifetime_top_entities: Vec<(String, u64)>,

    /// Trailing window.
    pub window_size: usize,
    pub top_terms: Vec<(String, u64)>,
    pub top_entities: Vec<(String, u64)>,
    pub window_sentiment: Vec<(SentimentLabel, u64)>,
    pub average_stars: f64,
    pub positive_ratio: f64,
}

/// The `k` most frequent items, count descending, ties broken by first occurrence.
pub fn top_k<'a, I>(items: I, k: usize) -> Vec<(String, u64)>
where
    I: IntoIterator<Item = &'a str>,
{
    // item -> (count, first seen)
    let mut counts: HashMap<&'a str, (u64, usize)> = HashMap::new();

    for (pos, item) in items.into_iter().enumerate() {
        counts.entry(item).or_insert((0, pos)).0 += 1;
    }

    let mut sorted: Vec<(&str, (u64, usize))> = counts.into_iter().collect();
    sorted.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));

    sorted
        .into_iter()
        .take(k)
        .map(|(item, (count, _))| (item.to_string(), count))
        .collect()
}

/// Lifetime counts of `counts`, highest first, ties by key.
fn top_of_counts(counts: &HashMap<String, u64>, k: usize) -> Vec<(String, u64)> {
    let mut sorted: Vec<(String, u64)> = counts.iter().map(|(key, n)| (key.clone(), *n)).collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    sorted.truncate(k);

    sorted
}

fn label_distribution<I: IntoIterator<Item = SentimentLabel>>(labels: I) -> Vec<(SentimentLabel, u64)> {
    let mut counts = [0u64; 3];

    for label in labels {
        counts[label_index(label)] += 1;
    }

    SentimentLabel::ALL
        .iter()
        .map(|label| (*label, counts[label_index(*label)]))
        .collect()
}

fn label_index(label: SentimentLabel) -> usize {
    match label {
        SentimentLabel::Positive => 0,
        SentimentLabel::Neutral => 1,
        SentimentLabel::Negative => 2,
    }
}

/// Compute a snapshot over the entries of `state` ingested at or after `cutoff`.
pub fn aggregate(
    state: &WindowState,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
    top_terms: usize,
    top_entities: usize,
) -> AggregateSnapshot {
    let reviews: Vec<_> = state
        .reviews
        .iter()
        .skip_while(|e| e.ingestion_time < cutoff)
        .collect();

    let terms = state
        .terms
        .iter()
        .skip_while(|e| e.ingestion_time < cutoff)
        .flat_map(|e| e.terms.iter().map(|t| t.as_str()));

    let (stars_sum, stars_count) = state
        .ratings
        .iter()
        .skip_while(|e| e.ingestion_time < cutoff)
        .fold((0.0, 0usize), |(sum, n), e| (sum + e.stars, n + 1));

    let window_sentiment = label_distribution(reviews.iter().map(|e| e.label));

    let positive = window_sentiment
        .iter()
        .find(|(label, _)| *label == SentimentLabel::Positive)
        .map_or(0, |(_, n)| *n);

    let totals = &state.totals;

    AggregateSnapshot {
        taken_at: now,
        total_reviews: totals.total_reviews,
        avg_review_length: totals.avg_review_length(),
        rating_distribution: totals
            .rating_histogram
            .iter()
            .map(|(stars, n)| (*stars, *n))
            .collect(),
        sentiment_distribution: SentimentLabel::ALL
            .iter()
            .map(|label| (*label, totals.sentiment_counts.get(label).copied().unwrap_or(0)))
            .collect(),
        lifetime_top_entities: top_of_counts(&totals.business_mentions, top_entities),
        window_size: reviews.len(),
        top_terms: top_k(terms, top_terms),
        top_entities: top_k(
            reviews
                .iter()
                .filter(|e| !e.business_id.is_empty())
                .map(|e| e.business_id.as_str()),
            top_entities,
        ),
        window_sentiment,
        average_stars: if stars_count == 0 {
            0.0
        } else {
            stars_sum / stars_count as f64
        },
        positive_ratio: if reviews.is_empty() {
            0.0
        } else {
            positive as f64 / reviews.len() as f64
        },
    }
}
