#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

//! # Engram Core
//!
//! A long-term memory engine for conversational AI agents: ingest
//! heterogeneous resources (conversations, documents, images, audio,
//! video), extract structured memory items through a language model,
//! organize them into self-maintaining categories, and retrieve them via a
//! hierarchical, LLM-assisted, sufficiency-checked pipeline.
//!
//! ## Core Concepts
//!
//! - **Resources**: ingested artifacts, one per (segment of a) source URL
//! - **Memory items**: atomic memories typed profile / event / knowledge /
//!   behavior / skill, deduplicated by content hash and reinforced on
//!   repetition
//! - **Categories**: configured semantic buckets whose model-maintained
//!   summaries grow as items arrive and may cite items inline with
//!   `[ref:ID]` tokens
//! - **Scope**: every record is partitioned by user scope fields; every
//!   read filters on them
//!
//! ## Module Organization
//!
//! ### Primary APIs
//! - [`service`]: the [`MemoryService`](service::MemoryService) facade with
//!   the `memorize` and `retrieve` entrypoints
//! - [`pipeline`]: the two workflow pipelines and their response shapes
//! - [`storage`]: repository traits plus the in-memory backend
//!
//! ### Support Modules
//! - [`types`]: records, discriminants, scope, content hashing
//! - [`vector`]: cosine and salience-weighted top-k ranking
//! - [`references`]: `[ref:ID]` citation parsing and rewriting
//! - [`workflow`]: the validated step-list engine
//! - [`prompts`]: default templates and user-overridable prompt blocks
//! - [`llm`]: the provider-agnostic LLM client and named profiles
//! - [`blob`], [`conversation`], [`video`]: ingest helpers
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use engram_core::config::ServiceConfig;
//! use engram_core::llm::LlmRegistry;
//! use engram_core::pipeline::{MemorizeRequest, QueryMessage};
//! use engram_core::service::MemoryService;
//! use engram_core::types::{Modality, Scope};
//!
//! #[tokio::main]
//! async fn main() -> engram_core::Result<()> {
//!     let config = ServiceConfig::default();
//!     let llm = Arc::new(LlmRegistry::from_profiles(HashMap::new())?);
//!     let service = MemoryService::with_inmemory(config, llm)?;
//!
//!     let response = service
//!         .memorize(MemorizeRequest {
//!             resource_url: "file:///data/chat.json".to_string(),
//!             modality: Modality::Conversation,
//!             user: Some(Scope::for_user("user-1")),
//!         })
//!         .await?;
//!     println!("persisted {} items", response.items.len());
//!
//!     let context = service
//!         .retrieve(
//!             &[QueryMessage::user("What do I usually drink?")],
//!             Some(Scope::for_user("user-1")),
//!         )
//!         .await?;
//!     println!("retrieved {} items", context.items.len());
//!     Ok(())
//! }
//! ```

pub mod blob;
pub mod config;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod prompts;
pub mod references;
pub mod service;
pub mod storage;
pub mod types;
pub mod vector;
pub mod video;
pub mod workflow;

// Re-export commonly used types
pub use config::{CategoryConfig, ServiceConfig};
pub use error::{Error, Result};
pub use pipeline::{
    MemorizeRequest, MemorizeResponse, QueryMessage, RetrieveResponse,
};
pub use service::MemoryService;
pub use storage::inmemory::InMemoryDatabase;
pub use storage::Database;
pub use types::{
    compute_content_hash, short_ref_id, MemoryCategory, MemoryItem, MemoryType, Modality,
    RankingStrategy, Resource, RetrieveMethod, Scope,
};
