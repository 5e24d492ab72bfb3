//! rowsync-batch: slicing change sets into bounded, ordered, resumable parts.
//!
//! # Overview
//! - `part`: the transfer unit and its versioned payload codec
//! - `split`: change set -> parts, and parts -> change set reassembly
//! - `spool`: server-side retention of in-flight batches with idle-TTL
//!   eviction
//!
//! Invariant throughout: parts `0..part_count` concatenated in index order
//! reconstruct exactly the originating change set.

pub mod part;
pub mod split;
pub mod spool;

pub use part::{BatchPart, PartPayload};
pub use split::{reassemble, split};
pub use spool::BatchSpool;
