//! Drained mutations go to the local cache first, then to the agent.

use async_trait::async_trait;

use hearth_agent::{AgentHandle, CacheError, SharedCache};
use hearth_types::{Mutation, PageId, PageMessage};

use crate::queue::{DrainReport, MutationSink, SinkError};

/// Writes each mutation to the cache and, when the cached value actually
/// changed, records it with the agent. After a drain, asks the agent to
/// forward and refetch every touched document, so one drain becomes one
/// remote change set per document and merges made elsewhere come back.
pub struct CacheSink {
    cache: SharedCache,
    agent: AgentHandle,
    page: PageId,
}

impl CacheSink {
    pub fn new(cache: SharedCache, agent: AgentHandle, page: PageId) -> Self {
        Self { cache, agent, page }
    }
}

#[async_trait]
impl MutationSink for CacheSink {
    async fn apply(&self, mutation: &Mutation) -> Result<bool, SinkError> {
        let changed = self.cache.lock().apply(mutation).map_err(|e| match e {
            CacheError::Mutation(e) => SinkError::Malformed(e),
            other => SinkError::Persistence(other.to_string()),
        })?;
        if !changed || !mutation.requires_network() {
            return Ok(changed);
        }

        let path = mutation.path();
        let Some(collection) = path.collection_name() else {
            return Ok(changed);
        };
        self.agent
            .send(
                self.page,
                PageMessage::BatchUpdate {
                    scope_key: path.scope().clone(),
                    document: path.document_name().to_string(),
                    collection: collection.to_string(),
                    property: path.property_name().map(str::to_string),
                    op: mutation.op(),
                },
            )
            .map_err(|e| SinkError::Agent(e.to_string()))?;
        Ok(true)
    }

    async fn drained(&self, report: &DrainReport) {
        for ((scope, document), collections) in &report.touched {
            let message = PageMessage::RefreshData {
                scope_key: scope.clone(),
                document: document.clone(),
                collections: Some(collections.iter().cloned().collect()),
            };
            if let Err(e) = self.agent.send(self.page, message) {
                tracing::warn!(%scope, document, error = %e, "could not request refetch");
            }
        }
    }
}
