//! Consumer side of rivulet: drains every partition of a stream and keeps analytics over a
//! trailing time window.
//!
//! One `ShardPoller` per partition fetches records in order and hands each payload to the
//! `RecordProcessor`, which extracts terms and a sentiment. Processed reviews are folded into
//! a shared `WindowStore`, behind one mutex, together with lifetime totals. The `Reporter`
//! periodically logs an `AggregateSnapshot` of it.
//!
//! Pollers share nothing but the store. A partition whose reads keep failing is given up on
//! its own, the other partitions keep going.

pub mod aggregator;
pub mod consumer;
pub mod processor;
pub mod reporter;
pub mod sentiment;
pub mod shard_poller;
pub mod window_store;
