//! # crm-vectorize
//!
//! **Incremental, resumable embedding backfill for CRM records.**
//!
//! Call transcripts and inbound/outbound email messages are turned into
//! fixed-length embedding vectors stored next to the source row, where the
//! assistant's semantic retrieval and similarity cache read them.
//!
//! ## Architecture
//!
//! ```text
//!             ┌──────────────┐
//!             │  Run control │  pipeline
//!             └──────┬───────┘
//!                    │ select pending (newest first, ≤ N)
//!                    ▼
//! ┌────────┐   ┌───────────┐   ┌───────────┐   ┌──────────┐
//! │ Store  │──▶│  Context  │──▶│ Embedding │──▶│  Store   │
//! │ select │   │  builder  │   │  client   │   │  write   │
//! └────────┘   └───────────┘   └─────┬─────┘   └──────────┘
//!                                    │ paced
//!                              ┌─────┴─────┐
//!                              │   Pacer   │
//!                              └───────────┘
//! ```
//!
//! A record is pending exactly when it has no vector. The vector and the
//! `embedded` flag are written together in one statement, so a run can be
//! interrupted at any point and the next run picks up where it stopped.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Record, key, and count types |
//! | [`store`] | `Store` trait and in-memory implementation |
//! | [`sqlite_store`] | SQLite `Store` over the CRM schema |
//! | [`context`] | Embedding input assembly |
//! | [`embedding`] | Providers, truncating client, vector encoding |
//! | [`pacing`] | Inter-call delay strategies |
//! | [`progress`] | Progress reporting and consistency check |
//! | [`pipeline`] | The run controller |
//! | [`embed_cmd`] | `run` / `rebuild` commands |
//! | [`stats`] | Coverage overview |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Schema creation |

pub mod config;
pub mod context;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod error;
pub mod migrate;
pub mod models;
pub mod pacing;
pub mod pipeline;
pub mod progress;
pub mod sqlite_store;
pub mod stats;
pub mod store;

pub use error::{FatalError, PersistenceError, ProviderError, RecordError};
pub use pipeline::{CancelFlag, Pipeline, RunOptions, RunReport};
pub use store::Store;
