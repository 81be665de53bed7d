//! Stream router: resolves a canonical stream URL to a backend.

use std::sync::Arc;

use tracing::debug;

use crate::backend::BackendServer;
use crate::balancer::LoadBalancer;
use crate::error::Result;

/// Stateless wrapper over the state backend's pick operation.
///
/// The stream URL key is always produced by the demux layer; the router
/// never derives it itself, so producers and consumers of the key cannot
/// drift apart.
#[derive(Clone)]
pub struct StreamRouter {
    lb: Arc<dyn LoadBalancer>,
}

impl StreamRouter {
    pub fn new(lb: Arc<dyn LoadBalancer>) -> Self {
        Self { lb }
    }

    /// Resolve `stream_url` to a backend, sticky per stream.
    pub async fn route(&self, stream_url: &str) -> Result<BackendServer> {
        let server = self.lb.pick(stream_url).await?;
        debug!(stream_url, backend = %server.id(), "routed stream");
        Ok(server)
    }
}
