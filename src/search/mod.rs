//! Search execution backend.
//!
//! The pipeline only depends on the [`SearchBackend`] trait; [`SearchClient`]
//! is the HTTP implementation used by the server.

mod client;
mod types;

pub use client::SearchClient;
pub use types::*;

use async_trait::async_trait;

use crate::error::SearchApiResult;

/// Resolves a query string into ranked search results.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Execute one search request.
    async fn search(&self, request: SearchRequest) -> SearchApiResult<SearchResponse>;
}
