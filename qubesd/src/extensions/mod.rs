//! Extension system.
//!
//! Extensions attach behaviour to core events without the core knowing
//! about them. Pre-hooks run before a mutation and may veto it by
//! returning an error; post-hook errors are logged and never roll the
//! operation back.

use crate::app::App;
use log::error;
use qubesd_common::{async_trait, Event, QubesResult};
use std::sync::Arc;

mod core_features;
mod network;
mod services;

pub use core_features::CoreFeaturesExtension;
pub use network::NetworkExtension;
pub use services::ServicesExtension;

#[async_trait]
pub trait Extension: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called before a vetoable operation. An error aborts it.
    async fn handle_pre_event(
        &self,
        _app: &App,
        _subject: &str,
        _event: &Event,
    ) -> QubesResult<()> {
        Ok(())
    }

    /// Called after a completed operation.
    async fn handle_event(&self, _app: &App, _subject: &str, _event: &Event) -> QubesResult<()> {
        Ok(())
    }
}

pub fn default_extensions() -> Vec<Arc<dyn Extension>> {
    vec![
        Arc::new(ServicesExtension),
        Arc::new(CoreFeaturesExtension),
        Arc::new(NetworkExtension),
    ]
}

pub struct ExtensionManager {
    extensions: Vec<Arc<dyn Extension>>,
}

impl ExtensionManager {
    pub fn new(extensions: Vec<Arc<dyn Extension>>) -> Self {
        Self { extensions }
    }

    pub fn all(&self) -> &[Arc<dyn Extension>] {
        &self.extensions
    }

    pub async fn fire_pre(&self, app: &App, subject: &str, event: &Event) -> QubesResult<()> {
        for extension in &self.extensions {
            extension.handle_pre_event(app, subject, event).await?;
        }
        Ok(())
    }

    pub async fn fire_post(&self, app: &App, subject: &str, event: &Event) {
        for extension in &self.extensions {
            if let Err(e) = extension.handle_event(app, subject, event).await {
                error!(
                    "extension {} failed on {} for {}: {}",
                    extension.name(),
                    event.name,
                    subject,
                    e
                );
            }
        }
    }
}
