//! # Chat Digest
//!
//! Daily analytics and structured export for chat logs.
//!
//! Chat Digest reads a day (or a range of days) of messages from a chat-log
//! server, normalizes them, and then either asks an LLM for a structured
//! digest of the conversation or exports every message as a row into a
//! Feishu Bitable table, with AI labels and uploaded media attachments.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌────────────┐   ┌───────────────────┐   ┌──────────┐
//! │ Chat log    │──▶│ Normalizer │──▶│ DigestSynthesizer │──▶│ stdout   │
//! │ (HTTP)      │   │  (core)    │   └───────────────────┘   └──────────┘
//! └─────────────┘   └─────┬──────┘   ┌───────────────────┐   ┌──────────┐
//!                         └─────────▶│ ExportCoordinator │──▶│ Bitable  │
//!                                    └───────────────────┘   └──────────┘
//! ```
//!
//! Pure logic (models, normalizer, JSON repair, statistics, batching) lives
//! in the `chat-digest-core` crate. This crate adds the collaborator traits,
//! the HTTP clients, and the async pipeline.
//!
//! ## Quick Start
//!
//! ```bash
//! chatdigest check
//! chatdigest digest 12345678@chatroom --name "Team" --date 2025-05-27
//! chatdigest export 12345678@chatroom --name "Team" --from 2025-05-01 --to 2025-05-27
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | Tracing subscriber setup |
//! | [`error`] | Typed pipeline errors |
//! | [`traits`] | Chat source, completion, destination, and token traits |
//! | [`completion`] | OpenAI-compatible completion client |
//! | [`chatlog`] | Chat-log HTTP reader |
//! | [`feishu`] | Feishu Bitable client |
//! | [`token_cache`] | Access token cache |
//! | [`digest`] | Digest synthesis |
//! | [`attachments`] | Media download and upload |
//! | [`export`] | Batch export coordination |
//! | [`ownership`] | Base ownership transfer |
//! | [`progress`] | Export progress reporting |
//! | [`cancel`] | Cooperative cancellation |
//! | [`sources`] | Connectivity checks |

pub mod attachments;
pub mod cancel;
pub mod chatlog;
pub mod completion;
pub mod config;
pub mod digest;
pub mod error;
pub mod export;
pub mod feishu;
pub mod logging;
pub mod ownership;
pub mod progress;
pub mod sources;
pub mod token_cache;
pub mod traits;
