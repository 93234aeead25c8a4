//! Shared types, error model, and configuration for NeuraMemory.
//!
//! This crate is the foundation depended on by all other NeuraMemory crates.
//! It provides:
//! - [`NeuraMemoryError`], the unified error type
//! - Domain types ([`MemoryFact`], [`ClassificationResult`], [`ProjectReference`], [`UserProfile`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, LlmConfig, RecallConfig, StorageConfig, config_dir, config_file_path, expand_home,
    init_config, load_config, load_config_from, validate_api_key,
};
pub use error::{NeuraMemoryError, Result};
pub use types::{
    ClassificationResult, EmbeddingMetadata, FactRecord, FactUpdate, MemoryFact, MemoryType,
    ProjectReference, RecalledMemory, UserProfile, VectorMatch,
};
