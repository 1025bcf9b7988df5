use anyhow::Result;
use log::{error, info};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_graceful_shutdown::SubsystemHandle;

use crate::aggregator::AggregateSnapshot;
use crate::shard_poller::ProgressTable;
use crate::window_store::AnalyticsSink;

/// Chars of an entity id shown in the report.
const ENTITY_DISPLAY_CHARS: usize = 20;

fn percent(n: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        n as f64 * 100.0 / total as f64
    }
}

fn short(id: &str) -> &str {
    match id.char_indices().nth(ENTITY_DISPLAY_CHARS) {
        Some((pos, _)) => &id[..pos],
        None => id,
    }
}

/// Text report of one snapshot.
struct Report<'a> {
    snapshot: &'a AggregateSnapshot,
    window_secs: u64,
}

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot;
        let line = "=".repeat(80);

        writeln!(f, "{}", line)?;
        writeln!(
            f,
            "REVIEW STREAM ANALYTICS ({}s window) at {}",
            self.window_secs,
            snapshot.taken_at.format("%Y-%m-%dT%H:%M:%S")
        )?;
        writeln!(f, "{}", line)?;

        let total = snapshot.total_reviews;

        writeln!(f, "OVERALL STATISTICS:")?;
        writeln!(f, "  Total Reviews Processed: {}", total)?;
        if snapshot.avg_review_length > 0.0 {
            writeln!(
                f,
                "  Average Review Length: {:.0} terms",
                snapshot.avg_review_length
            )?;
        }

        if !snapshot.rating_distribution.is_empty() {
            writeln!(f, "  Rating Distribution:")?;
            for (stars, n) in snapshot.rating_distribution.iter() {
                writeln!(f, "    {} stars: {} ({:.1}%)", stars, n, percent(*n, total))?;
            }
        }

        if total > 0 {
            writeln!(f, "  Sentiment Distribution:")?;
            for (label, n) in snapshot.sentiment_distribution.iter() {
                writeln!(f, "    {}: {} ({:.1}%)", label, n, percent(*n, total))?;
            }
        }

        if !snapshot.lifetime_top_entities.is_empty() {
            writeln!(f, "  Most Reviewed Businesses Overall:")?;
            for (i, (id, n)) in snapshot.lifetime_top_entities.iter().enumerate() {
                writeln!(f, "    {}. {}: {} reviews", i + 1, short(id), n)?;
            }
        }

        writeln!(f, "REAL-TIME WINDOW ANALYTICS:")?;

        if !snapshot.top_terms.is_empty() {
            writeln!(f, "  Top {} Trending Words:", snapshot.top_terms.len())?;
            for (i, (term, n)) in snapshot.top_terms.iter().enumerate() {
                writeln!(f, "    {}. {}: {} occurrences", i + 1, term, n)?;
            }
        }

        if snapshot.window_size > 0 {
            writeln!(f, "  Window Sentiment Analysis:")?;
            writeln!(f, "    Reviews in window: {}", snapshot.window_size)?;
            writeln!(f, "    Average rating: {:.2}", snapshot.average_stars)?;
            writeln!(f, "    Positive ratio: {:.1}%", snapshot.positive_ratio * 100.0)?;

            let dist: Vec<String> = snapshot
                .window_sentiment
                .iter()
                .map(|(label, n)| format!("{}: {}", label, n))
                .collect();
            writeln!(f, "    Distribution: {}", dist.join(", "))?;
        } else {
            writeln!(f, "  No reviews in window")?;
        }

        if !snapshot.top_entities.is_empty() {
            writeln!(
                f,
                "  Top {} Most Reviewed Businesses:",
                snapshot.top_entities.len()
            )?;
            for (i, (id, n)) in snapshot.top_entities.iter().enumerate() {
                writeln!(f, "    {}. {}: {} reviews", i + 1, short(id), n)?;
            }
        }

        write!(f, "{}", line)
    }
}

/// Render a snapshot as a multi-line text report.
pub fn render(snapshot: &AggregateSnapshot, window_secs: u64) -> String {
    Report {
        snapshot,
        window_secs,
    }
    .to_string()
}

/// One line per partition, ordered by partition.
pub fn render_progress(table: &ProgressTable) -> String {
    let mut rows: Vec<_> = table.iter().map(|e| e.value().clone()).collect();
    rows.sort_by_key(|p| p.partition);

    rows.iter()
        .map(|p| {
            format!(
                "partition {}: {}, records: {}, failed: {}, empty polls: {}, fetch errors: {}",
                p.partition, p.state, p.records, p.failed_records, p.empty_polls, p.fetch_errors
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Logs a report every `interval`. Purely an observer of the sink.
pub struct Reporter {
    sink: Arc<dyn AnalyticsSink>,
    table: ProgressTable,
    interval: Duration,
    window_secs: u64,
}

impl Reporter {
    pub fn new(
        sink: Arc<dyn AnalyticsSink>,
        table: ProgressTable,
        interval: Duration,
        window_secs: u64,
    ) -> Self {
        Self {
            sink,
            table,
            interval,
            window_secs,
        }
    }

    pub fn report(&self) {
        match self.sink.snapshot() {
            Ok(snapshot) => {
                info!("\n{}", render(&snapshot, self.window_secs));
                info!("partitions:\n{}", render_progress(&self.table));
            }
            Err(e) => {
                error!("take snapshot failed, error: {}", e);
            }
        }
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<()> {
        info!("reporter started, interval: {:?}", self.interval);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.report();
                }
                _ = subsys.on_shutdown_requested() => {
                    info!("reporter shutdown!");
                    break;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sentiment::SentimentLabel;
    use crate::shard_poller::{PartitionProgress, PollerState};
    use chrono::Utc;
    use dashmap::DashMap;

    fn snapshot() -> AggregateSnapshot {
        AggregateSnapshot {
            taken_at: Utc::now(),
            total_reviews: 4,
            avg_review_length: 2.0,
            rating_distribution: vec![(1, 1), (5, 3)],
            sentiment_distribution: vec![
                (SentimentLabel::Positive, 3),
                (SentimentLabel::Neutral, 0),
                (SentimentLabel::Negative, 1),
            ],
            lifetime_top_entities: vec![("biz_with_a_very_long_identifier".to_string(), 4)],
            window_size: 4,
            top_terms: vec![("great".to_string(), 3), ("food".to_string(), 3)],
            top_entities: vec![("biz_with_a_very_long_identifier".to_string(), 4)],
            window_sentiment: vec![
                (SentimentLabel::Positive, 3),
                (SentimentLabel::Neutral, 0),
                (SentimentLabel::Negative, 1),
            ],
            average_stars: 4.0,
            positive_ratio: 0.75,
        }
    }

    #[test]
    fn test_render() {
        let text = render(&snapshot(), 300);

        assert!(text.contains("Total Reviews Processed: 4"));
        assert!(text.contains("5 stars: 3 (75.0%)"));
        assert!(text.contains("positive: 3 (75.0%)"));
        assert!(text.contains("1. great: 3 occurrences"));
        assert!(text.contains("Positive ratio: 75.0%"));
        assert!(text.contains("Average rating: 4.00"));
        assert!(text.contains("1. biz_with_a_very_long: 4 reviews"));
    }

    #[test]
    fn test_render_empty_window() {
        let mut s = snapshot();
        s.window_size = 0;
        s.top_terms.clear();
        s.top_entities.clear();

        let text = render(&s, 60);
        assert!(text.contains("No reviews in window"));
        assert!(!text.contains("Trending Words"));
    }

    #[test]
    fn test_render_progress() {
        let table: ProgressTable = Arc::new(DashMap::new());
        for p in [2, 0, 1] {
            table.insert(
                p,
                PartitionProgress {
                    partition: p,
                    state: PollerState::Closed,
                    records: p as u64,
                    ..PartitionProgress::default()
                },
            );
        }

        let text = render_progress(&table);
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("partition 0: closed"));
        assert!(lines[2].contains("records: 2"));
    }
}
