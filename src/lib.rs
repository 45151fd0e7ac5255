//! # Balise
//!
//! A self-hosted Terraform/OpenTofu registry that continuously mirrors
//! upstream providers and CLI binaries into local object storage.
//!
//! ## Components
//!
//! - **Mirror sync engine** ([`mirror`]): scheduled and on-demand
//!   synchronization of provider and CLI-binary mirrors, with checksum
//!   and GPG verification, deduplication, and append-only history
//! - **SCM layer** ([`scm`]): one connector abstraction over GitHub,
//!   GitLab, Azure DevOps, and Bitbucket Data Center
//! - **Gateway** ([`gateway`]): JWT / API key authentication, scope-based
//!   authorization, token-bucket rate limiting, audit recording
//! - **Storage** ([`storage`]): local filesystem and S3-compatible object
//!   stores behind one contract, with presigned downloads
//! - **Workers** ([`workers`]): tag-immutability verification and API key
//!   expiry notification
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use balise::persist::MemoryStore;
//! use balise::mirror::MirrorEngine;
//! use balise::storage::LocalFsBackend;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let storage = Arc::new(LocalFsBackend::new(&Default::default())?);
//!     let engine = Arc::new(MirrorEngine::new(
//!         store.clone(),
//!         store,
//!         storage,
//!         5,
//!         Default::default(),
//!     ));
//!     tokio::spawn(engine.clone().run_scheduler());
//!     Ok(())
//! }
//! ```

#![warn(clippy::all, rust_2018_idioms)]

pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod mirror;
pub mod notify;
pub mod persist;
pub mod scm;
pub mod storage;
pub mod types;
pub mod version;
pub mod workers;

// Re-export commonly used types at crate root
pub use config::Config;
pub use error::{BaliseError, Result};
pub use scm::ProviderKind;
