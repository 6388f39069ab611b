//! Batches serialized log items from many producers and ships them to a
//! bulk-ingest endpoint, flushing by size or on a fixed interval.

pub mod conversions;
pub mod pipeline;
