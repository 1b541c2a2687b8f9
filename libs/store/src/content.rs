//! Content persistence: rendered-asset writeback and repurpose jobs.

use async_trait::async_trait;
use serde_json::Value;

use crate::StoreError;

/// Source material for a repurpose run.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePost {
    pub post_id: String,
    pub org_id: String,
    pub title: String,
    pub body: String,
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Writes the generated asset URL and provider metadata back onto the
    /// originating asset row.
    async fn complete_asset(
        &self,
        asset_id: &str,
        url: &str,
        metadata: &Value,
    ) -> Result<(), StoreError>;

    /// Loads the source post for a repurpose job, if it still exists.
    async fn source_post(&self, post_id: &str) -> Result<Option<SourcePost>, StoreError>;

    /// Persists one derivative post (`story` / `email` / `video` mode).
    async fn insert_derivative(
        &self,
        org_id: &str,
        source_post_id: &str,
        mode: &str,
        body: &str,
    ) -> Result<String, StoreError>;

    /// Marks the `repurpose_jobs` row completed or not-found.
    async fn finish_repurpose_job(
        &self,
        post_id: &str,
        completed: bool,
    ) -> Result<(), StoreError>;
}
