//! # Chat Digest Core
//!
//! Shared, I/O-free logic for chat-digest: message models, the message
//! normalizer, the resilient JSON extractor used on completion output,
//! deterministic activity statistics, and batch partitioning.
//!
//! This crate contains no tokio, reqwest, or filesystem I/O. Everything in
//! it is a pure transform that the pipeline crate drives.

pub mod batch;
pub mod json_repair;
pub mod models;
pub mod normalize;
pub mod stats;
