use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{error, warn};

use crate::error::Result;
use crate::fetch::Artifact;

#[derive(Clone, Debug)]
pub enum AppEvent {
    BeforeUpdate {
        app_id: i64,
    },
    Updated {
        app_id: i64,
        updated_at: i64,
        /// Present for archive artifacts, whose deployed form is a directory.
        artifact: Option<Artifact>,
    },
    Deleted {
        app_id: i64,
    },
}

impl AppEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BeforeUpdate { .. } => "before-update",
            Self::Updated { .. } => "updated",
            Self::Deleted { .. } => "deleted",
        }
    }

    pub fn app_id(&self) -> i64 {
        match self {
            Self::BeforeUpdate { app_id }
            | Self::Updated { app_id, .. }
            | Self::Deleted { app_id } => *app_id,
        }
    }
}

/// Receiver of application lifecycle events.
#[async_trait]
pub trait AppEventListener: Send + Sync {
    async fn on_before_update(&self, _app_id: i64) -> Result<()> {
        Ok(())
    }

    async fn on_updated(
        &self,
        _app_id: i64,
        _updated_at: i64,
        _artifact: Option<&Artifact>,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_deleted(&self, _app_id: i64) -> Result<()> {
        Ok(())
    }
}

/// In-process bus delivering each event to every listener in registration order.
///
/// A failing or panicking listener is logged and does not stop delivery.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<Vec<Arc<dyn AppEventListener>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn AppEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    pub async fn publish(&self, event: &AppEvent) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            let delivery = async {
                match event {
                    AppEvent::BeforeUpdate { app_id } => listener.on_before_update(*app_id).await,
                    AppEvent::Updated {
                        app_id,
                        updated_at,
                        artifact,
                    } => {
                        listener
                            .on_updated(*app_id, *updated_at, artifact.as_ref())
                            .await
                    }
                    AppEvent::Deleted { app_id } => listener.on_deleted(*app_id).await,
                }
            };
            match AssertUnwindSafe(delivery).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    event = event.name(),
                    app_id = event.app_id(),
                    code = err.code(),
                    error = %err,
                    "event-listener-failed"
                ),
                Err(_) => error!(
                    event = event.name(),
                    app_id = event.app_id(),
                    "event-listener-panicked"
                ),
            }
        }
    }
}
