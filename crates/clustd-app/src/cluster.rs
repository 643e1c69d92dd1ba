//! Cluster coordination machine behavior.
//!
//! Master election is decided elsewhere; this handler only reports the
//! current answer to peers that ask for it.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use clustd_core::{HandlerError, RequestHandler};
use serde_json::{Value, json};
use tracing::debug;

/// Where the current master id comes from.
pub trait MasterSource: Send + Sync + 'static {
    /// Current master id, if one is known.
    fn current_master(&self) -> Option<String>;
}

impl<F> MasterSource for F
where
    F: Fn() -> Option<String> + Send + Sync + 'static,
{
    fn current_master(&self) -> Option<String> {
        self()
    }
}

/// Master id held in memory and updated by whoever runs the election.
#[derive(Debug, Clone, Default)]
pub struct StaticMaster {
    master: Arc<RwLock<Option<String>>>,
}

impl StaticMaster {
    /// Start with `master` as the known master.
    pub fn new(master: Option<String>) -> Self {
        Self { master: Arc::new(RwLock::new(master)) }
    }

    /// Replace the known master.
    pub fn set(&self, master: Option<String>) {
        *self.master.write().unwrap_or_else(PoisonError::into_inner) = master;
    }
}

impl MasterSource for StaticMaster {
    fn current_master(&self) -> Option<String> {
        self.master.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Serves `get_master`.
pub struct ClusterHandler<S> {
    source: S,
}

impl<S: MasterSource> ClusterHandler<S> {
    /// Create a handler reading from `source`.
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

#[async_trait]
impl<S: MasterSource> RequestHandler for ClusterHandler<S> {
    async fn handle(&self, method: &str, _params: Option<Value>) -> Result<Value, HandlerError> {
        match method {
            "get_master" => {
                let master = self
                    .source
                    .current_master()
                    .ok_or_else(|| HandlerError::Failed("master ID must be present".into()))?;
                debug!(%master, "Answering get_master");
                Ok(json!({ "master": master }))
            },
            _ => Err(HandlerError::Unrecognized),
        }
    }
}
