//! # kb-console
//!
//! Client core for a retrieval-augmented knowledge-base backend.
//!
//! kb-console owns everything between a user command and the backend's HTTP
//! API: a shared request pipeline that rate-limits, retries and
//! authenticates every call, a multi-document ingestion orchestrator that
//! isolates per-file failures, and a poller that follows the backend's
//! indexing of what was uploaded.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌────────────────────────────┐
//! │   CLI    │──▶│  ApiClient   │──▶│      RequestGateway        │
//! │  (kbc)   │   │ typed calls  │   │ session ▸ retry ▸ limiter  │
//! └────┬─────┘   └──────▲───────┘   └─────────────┬──────────────┘
//!      │                │                         ▼
//!      │         ┌──────┴───────┐          ┌────────────┐
//!      ├────────▶│  Ingestion   │          │ Transport  │──▶ backend
//!      │         │ Orchestrator │          │ (reqwest)  │
//!      │         └──────────────┘          └────────────┘
//!      │         ┌──────────────┐
//!      └────────▶│   Indexing   │
//!                │    Poller    │
//!                └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kbc login alice
//! kbc ingest "Team handbook" docs/*.md --watch
//! kbc search <kb-id> "parental leave"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy shared by every request |
//! | [`rate_limit`] | Sliding-window outbound rate limiter |
//! | [`retry`] | Exponential-backoff retry policy |
//! | [`session`] | Session slot, persistence and change events |
//! | [`transport`] | Request descriptors and the HTTP transport |
//! | [`gateway`] | The request pipeline every call goes through |
//! | [`models`] | Backend wire types |
//! | [`api`] | Typed endpoint wrappers |
//! | [`estimate`] | Chunk-count and processing-time estimates |
//! | [`progress`] | Progress events and reporters |
//! | [`ingest`] | Sequential multi-document ingestion |
//! | [`poller`] | Indexing progress polling |
//! | [`commands`] | CLI command handlers |

pub mod api;
pub mod commands;
pub mod config;
pub mod error;
pub mod estimate;
pub mod gateway;
pub mod ingest;
pub mod models;
pub mod poller;
pub mod progress;
pub mod rate_limit;
pub mod retry;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;
