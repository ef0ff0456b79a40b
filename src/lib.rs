//! # FAQ Harness
//!
//! Semantic retrieval over a tenant's content, plus a once-a-day mining
//! pass that turns the questions search could not answer into FAQ drafts.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────┐
//! │ Sources  │──▶│   Indexer    │──▶│  Store   │◀──────────────┐
//! │ + FAQ    │   │ Chunk+Embed  │   │ (SQLite) │               │
//! └──────────┘   └──────────────┘   └────┬─────┘               │
//!                                        │ match_chunks        │ drafts
//!                  query ──▶ ┌───────────▼──┐  search_logs ┌────┴─────┐
//!                            │ SearchEngine │─────────────▶│  Mining  │
//!                            └──────────────┘              └────┬─────┘
//!                                                               ▼
//!                                                     publish ▶ knowledge
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Typed error taxonomy |
//! | [`logging`] | `tracing` subscriber set-up |
//! | [`clock`] | Injectable time source |
//! | [`models`] | Core data types |
//! | [`chunk`] | Paragraph-boundary text chunking |
//! | [`embedding`] | Embedding providers, retry/backoff, batch worker pool |
//! | [`completion`] | Chat completion providers |
//! | [`store`] | Storage trait with in-memory and SQLite backends |
//! | [`indexer`] | Full-replace source re-indexing |
//! | [`search`] | Retrieval-augmented answering and query logging |
//! | [`aggregate`] | Grouping and prioritising logged questions |
//! | [`mining`] | Daily mining runs |
//! | [`drafts`] | Draft publish/discard |
//! | [`pipeline`] | Component wiring |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod aggregate;
pub mod chunk;
pub mod clock;
pub mod completion;
pub mod config;
pub mod db;
pub mod drafts;
pub mod embedding;
pub mod error;
pub mod indexer;
pub mod logging;
pub mod migrate;
pub mod mining;
pub mod models;
pub mod pipeline;
pub mod search;
pub mod server;
pub mod store;
