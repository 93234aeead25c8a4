//! Fact ingestion and entity resolution for NeuraMemory.
//!
//! Takes a classification of a conversation turn, attaches it to an existing
//! project when one matches, derives the storage key and category, enriches
//! bare status values, and hands the result to the fact store and vector index.

pub mod enrichment;
pub mod gemini;
pub mod keys;
pub mod manager;
pub mod pipeline;
pub mod resolver;
pub mod services;

pub use manager::{MemoryManager, forget_fact, load_profile};
pub use pipeline::{FactPlan, IngestOutcome, IngestPipeline, TurnInput, plan_fact};
pub use resolver::{MatchRule, Resolution, ResolutionError, ResolvedRoot};
pub use services::{Classifier, Clock, Embedder, FactStore, FixedClock, SystemClock, VectorIndex};
