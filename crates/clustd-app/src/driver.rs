//! Driver machine behavior.
//!
//! A driver is an external subsystem the cluster switches on and off when
//! master state changes. The [`Driver`] trait is what the subsystem
//! implements; [`DriverHandler`] exposes it over RPC.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use clustd_core::{HandlerError, RequestHandler};
use serde_json::{Value, json};
use tracing::{debug, info};

/// A controllable subsystem.
///
/// Each operation reports whether it succeeded.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Bring the subsystem up.
    async fn start(&self) -> bool;

    /// Take the subsystem down.
    async fn stop(&self) -> bool;

    /// Notify the subsystem of a master-state change.
    async fn trigger(&self, params: Option<Value>) -> bool;
}

/// Serves `start`, `stop` and `trigger`, each answering `{"success": bool}`.
/// Any other method answers `{"success": false}`.
pub struct DriverHandler<D> {
    driver: D,
}

impl<D: Driver> DriverHandler<D> {
    /// Wrap `driver`.
    pub fn new(driver: D) -> Self {
        Self { driver }
    }

    /// The wrapped driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }
}

#[async_trait]
impl<D: Driver> RequestHandler for DriverHandler<D> {
    async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, HandlerError> {
        let success = match method {
            "start" => self.driver.start().await,
            "stop" => self.driver.stop().await,
            "trigger" => self.driver.trigger(params).await,
            _ => {
                debug!(method, "Unknown driver method");
                false
            },
        };
        Ok(json!({ "success": success }))
    }
}

/// In-memory driver: a running flag and a trigger count.
///
/// `start` succeeds only when stopped, `stop` only when running.
#[derive(Debug, Default)]
pub struct StateDriver {
    running: AtomicBool,
    triggers: AtomicU64,
}

impl StateDriver {
    /// Whether the subsystem is up.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Triggers received so far.
    pub fn triggers(&self) -> u64 {
        self.triggers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Driver for StateDriver {
    async fn start(&self) -> bool {
        let started = !self.running.swap(true, Ordering::SeqCst);
        info!(started, "Driver start requested");
        started
    }

    async fn stop(&self) -> bool {
        let stopped = self.running.swap(false, Ordering::SeqCst);
        info!(stopped, "Driver stop requested");
        stopped
    }

    async fn trigger(&self, params: Option<Value>) -> bool {
        self.triggers.fetch_add(1, Ordering::SeqCst);
        info!(?params, "Driver triggered");
        self.is_running()
    }
}
