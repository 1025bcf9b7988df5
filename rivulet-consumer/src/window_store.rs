//! Shared analytics state of the consumer.
//!
//! Every poller folds its reviews into one `WindowStore`. It holds three trailing windows
//! and the lifetime totals behind a single mutex:
//! - reviews: entity, rating, and sentiment label of each review.
//! - terms: the term list of each review.
//! - ratings: the star rating of each review.
//!
//! Entries are stamped with their ingestion time and appended at the tail, so each window
//! is ordered by ingestion time. An entry older than `now - window` is stale. Stale entries
//! are evicted from the head on append. Snapshots skip them without touching the state.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use hashbrown::HashMap;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::aggregator::{aggregate, AggregateSnapshot};
use crate::processor::ProcessedReview;
use crate::sentiment::SentimentLabel;

/// Where processed reviews go, and where snapshots come from.
///
/// Pollers and the reporter only see this trait, so tests can swap the store.
pub trait AnalyticsSink: Send + Sync {
    /// Append one review as ingested at `now`. Atomic per review.
    fn append_at(&self, review: ProcessedReview, now: DateTime<Utc>) -> Result<()>;

    /// Aggregates over the entries not stale at `now`.
    fn snapshot_at(&self, now: DateTime<Utc>) -> Result<AggregateSnapshot>;

    fn append(&self, review: ProcessedReview) -> Result<()> {
        self.append_at(review, Utc::now())
    }

    fn snapshot(&self) -> Result<AggregateSnapshot> {
        self.snapshot_at(Utc::now())
    }
}

#[derive(Debug, Clone)]
pub struct ReviewEntry {
    pub ingestion_time: DateTime<Utc>,
    pub event_time: DateTime<Utc>,
    pub business_id: String,
    pub stars: f64,
    pub label: SentimentLabel,
}

#[derive(Debug, Clone)]
pub struct TermsEntry {
    pub ingestion_time: DateTime<Utc>,
    pub event_time: DateTime<Utc>,
    pub terms: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RatingEntry {
    pub ingestion_time: DateTime<Utc>,
    pub event_time: DateTime<Utc>,
    pub stars: f64,
}

/// Counters over every review ever appended. Never evicted.
#[derive(Debug, Default, Clone)]
pub struct RunningTotals {
    pub total_reviews: u64,
    pub total_terms: u64,
    pub sentiment_counts: HashMap<SentimentLabel, u64>,

    /// Keyed by the integer part of the rating.
    pub rating_histogram: BTreeMap<i64, u64>,

    pub business_mentions: HashMap<String, u64>,
}

impl RunningTotals {
    /// Mean number of terms per review.
    pub fn avg_review_length(&self) -> f64 {
        if self.total_reviews == 0 {
            0.0
        } else {
            self.total_terms as f64 / self.total_reviews as f64
        }
    }

    fn add(&mut self, review: &ProcessedReview) {
        self.total_reviews += 1;
        self.total_terms += review.terms.len() as u64;

        *self.sentiment_counts.entry(review.sentiment.label).or_insert(0) += 1;
        *self.rating_histogram.entry(review.stars.trunc() as i64).or_insert(0) += 1;

        if !review.business_id.is_empty() {
            *self
                .business_mentions
                .entry(review.business_id.clone())
                .or_insert(0) += 1;
        }
    }
}

#[derive(Debug, Default)]
pub struct WindowState {
    pub reviews: VecDeque<ReviewEntry>,
    pub terms: VecDeque<TermsEntry>,
    pub ratings: VecDeque<RatingEntry>,
    pub totals: RunningTotals,
}

impl WindowState {
    /// Pop stale entries off the head of every window.
    fn evict(&mut self, cutoff: DateTime<Utc>) {
        while self.reviews.front().map_or(false, |e| e.ingestion_time < cutoff) {
            self.reviews.pop_front();
        }
        while self.terms.front().map_or(false, |e| e.ingestion_time < cutoff) {
            self.terms.pop_front();
        }
        while self.ratings.front().map_or(false, |e| e.ingestion_time < cutoff) {
            self.ratings.pop_front();
        }
    }

    fn last_ingestion_time(&self) -> Option<DateTime<Utc>> {
        self.reviews.back().map(|e| e.ingestion_time)
    }
}

/// The in-memory `AnalyticsSink`.
pub struct WindowStore {
    window: Duration,
    top_terms: usize,
    top_entities: usize,
    state: Mutex<WindowState>,
}

impl WindowStore {
    pub fn new(window: Duration, top_terms: usize, top_entities: usize) -> Self {
        Self {
            window,
            top_terms,
            top_entities,
            state: Mutex::new(WindowState::default()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Number of entries physically held in the review window, stale ones included.
    pub fn held(&self) -> Result<usize> {
        Ok(self.lock()?.reviews.len())
    }

    /// Entries ingested before this are stale at `now`.
    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn lock(&self) -> Result<MutexGuard<'_, WindowState>> {
        self.state
            .lock()
            .map_err(|e| anyhow!("window store lock poisoned: {}", e))
    }
}

impl AnalyticsSink for WindowStore {
    fn append_at(&self, review: ProcessedReview, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock()?;

        // Ingestion times never go backwards inside the windows.
        let ingestion_time = match state.last_ingestion_time() {
            Some(last) if last > now => last,
            _ => now,
        };

        state.totals.add(&review);

        state.reviews.push_back(ReviewEntry {
            ingestion_time,
            event_time: review.event_time,
            business_id: review.business_id,
            stars: review.stars,
            label: review.sentiment.label,
        });

        state.ratings.push_back(RatingEntry {
            ingestion_time,
            event_time: review.event_time,
            stars: review.stars,
        });

        state.terms.push_back(TermsEntry {
            ingestion_time,
            event_time: review.event_time,
            terms: review.terms,
        });

        state.evict(self.cutoff(ingestion_time));

        Ok(())
    }

    fn snapshot_at(&self, now: DateTime<Utc>) -> Result<AggregateSnapshot> {
        let state = self.lock()?;

        Ok(aggregate(
            &state,
            self.cutoff(now),
            now,
            self.top_terms,
            self.top_entities,
        ))
    }
}
