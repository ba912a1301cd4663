//! fineprint — privacy-first legal document monitoring data plane.
//!
//! The pipeline: crawl monitored pages under per-host rate limits, detect
//! content changes by fingerprint, run changed versions through pattern
//! matching + semantic clause search + one LLM summarization call, persist
//! findings, and evaluate jurisdiction compliance over the results.
//!
//! | Module        | Responsibility                                          |
//! |---------------|---------------------------------------------------------|
//! | `fingerprint` | Text normalization, SHA-256 content identity, excerpts  |
//! | `ratelimit`   | Per-host token buckets + global in-flight cap           |
//! | `crawler`     | Bounded fetching, selector-hint extraction, quarantine  |
//! | `store`       | Relational metadata (SQLite): documents, versions, analyses, findings, rules, alerts, audit |
//! | `cache`       | Typed TTL cache, windowed counters, dedup locks         |
//! | `vector`      | Collection-scoped vector index + embedding seam         |
//! | `queue`       | Priority queues with visibility leases and dead letters |
//! | `pipeline`    | Intake processing and the analysis orchestrator         |
//! | `change`      | Paragraph-digest diffing and change classification      |
//! | `compliance`  | Jurisdiction rules, alerts, rolling trend counters      |
//! | `events`      | Broadcast bus for downstream queue events               |
//! | `runtime`     | Composition root, worker pools, graceful shutdown       |
//!
//! External collaborators (cache service, vector database, LLM) sit behind
//! traits with in-process defaults, so the whole plane runs self-contained
//! in tests and single-node deployments.
//!
//! ```no_run
//! use fineprint::config::Config;
//! use fineprint::runtime::Runtime;
//!
//! # async fn start() -> fineprint::error::Result<()> {
//! let config = Config::default().apply_env();
//! let runtime = Runtime::builder(config).build().await?;
//! runtime.start();
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod change;
pub mod compliance;
pub mod config;
pub mod crawler;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod llm;
pub mod model;
pub mod monitor;
pub mod pipeline;
pub mod queue;
pub mod ratelimit;
pub mod runtime;
pub mod store;
pub mod vector;

pub use error::{Error, ErrorClass, Result};
