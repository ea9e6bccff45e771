//! Pluggable per-request work.

use async_trait::async_trait;

use crate::{RequestEnvelope, Result};

/// Work done by the worker between receiving a request and publishing its
/// response.
///
/// An error fails the request: no response is published and the request is
/// reported as a batch failure, so the queue redelivers it later.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, request: &RequestEnvelope) -> Result<()>;
}

/// Does nothing; the response is an echo of the request identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

#[async_trait]
impl Processor for PassThrough {
    async fn process(&self, _request: &RequestEnvelope) -> Result<()> {
        Ok(())
    }
}
