//! Producer side of rivulet: moves reviews from a bulk source into the log.
//!
//! The source is newline-delimited JSON and can be much larger than memory, so
//! `SourceReader` reads it chunk by chunk and rebuilds lines cut by chunk boundaries.
//! `ReviewSource` turns lines into reviews, skipping what does not parse.
//!
//! `Producer` stamps each review with the send time and derives its partition key from the
//! first 10 chars of `user_id`. Records of the same user land in the same partition and
//! keep their order there.
//!
//! Records are grouped by `Batcher` into batches of 25 and sent by `DeliveryClient`. The
//! log answers per record, so a batch can partially fail. Only the rejected records are
//! sent again, after a delay, in their original order, up to a fixed number of attempts.
//! A batch that is still not fully delivered after that is reported as
//! `DeliveryError::RetriesExhausted`, and the producer goes on with the next batch.

pub mod batcher;
pub mod delivery;
pub mod producer;
pub mod sample;
pub mod source_reader;
