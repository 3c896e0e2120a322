//! Memory/knowledge port.
//!
//! Consulted for contextual grounding before planning, and written to when
//! the oracle decides something is worth remembering. Semantic storage
//! itself is an external collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Memory backend error: {0}")]
    Backend(String),
}

/// One retrieved memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryHit {
    pub content: String,
    /// Relevance score in [0.0, 1.0].
    pub score: f64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Trait for memory/knowledge backends.
#[async_trait]
pub trait MemoryPort: Send + Sync {
    async fn search(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryHit>, MemoryError>;

    async fn store(
        &self,
        user_id: &str,
        content: &str,
        metadata: serde_json::Value,
    ) -> Result<(), MemoryError>;
}

/// No-op memory backend for wiring without semantic storage.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMemory;

#[async_trait]
impl MemoryPort for NullMemory {
    async fn search(
        &self,
        _user_id: &str,
        _query: &str,
        _limit: usize,
    ) -> Result<Vec<MemoryHit>, MemoryError> {
        Ok(Vec::new())
    }

    async fn store(
        &self,
        _user_id: &str,
        _content: &str,
        _metadata: serde_json::Value,
    ) -> Result<(), MemoryError> {
        Ok(())
    }
}
