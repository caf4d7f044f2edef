// Streaming infrastructure bundle
//
// Everything an HTTP layer needs to expose the engine, wired from one
// configuration. The HTTP crate only ever talks to these handles.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tvrelay_core::config::Config;
use tvrelay_core::source::SourceResolver;
use tvrelay_core::store::{Keys, StateStore};

use crate::delivery::{HlsDelivery, TsDelivery};
use crate::reaper::IdleReaper;
use crate::registry::StreamRegistry;

#[derive(Clone)]
pub struct StreamingInfrastructure {
    /// Create-or-attach map of shared streams
    pub registry: StreamRegistry,
    /// Per-client TS feeds
    pub ts: TsDelivery,
    /// Manifest and segment serving
    pub hls: HlsDelivery,
    /// Identifies this node as a stream owner
    pub node_id: String,
}

impl StreamingInfrastructure {
    pub fn new(
        config: &Config,
        store: Arc<dyn StateStore>,
        resolver: Arc<dyn SourceResolver>,
        node_id: impl Into<String>,
    ) -> Self {
        let node_id = node_id.into();
        let registry = StreamRegistry::new(
            store,
            Keys::new(config.redis.key_prefix.clone()),
            resolver,
            node_id.clone(),
            config.streaming.clone(),
            config.hls.clone(),
        );

        Self {
            ts: TsDelivery::new(registry.clone()),
            hls: HlsDelivery::new(registry.clone()),
            registry,
            node_id,
        }
    }

    /// Start the idle reaper. It runs until `cancel` fires.
    pub fn start_reaper(&self, config: &Config, cancel: CancellationToken) -> JoinHandle<()> {
        IdleReaper::new(self.registry.clone(), &config.reaper).spawn(cancel)
    }

    /// Stop every stream this node owns.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}
