//! Pull-based survey definition sync.
//!
//! Polls the server's version endpoint and downloads the full bundle only
//! when the advertised checksum differs from the cached one. A version
//! counter alone never triggers a download; content equality is what
//! counts. In-progress sessions keep the definition they started with;
//! only new sessions pick up a replacement.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{SyncError, SyncTransport};
use crate::definition::DefinitionStore;

pub struct DefinitionSync {
    transport: Arc<dyn SyncTransport>,
    store: Arc<DefinitionStore>,
}

impl DefinitionSync {
    pub fn new(transport: Arc<dyn SyncTransport>, store: Arc<DefinitionStore>) -> Self {
        Self { transport, store }
    }

    /// One poll cycle. Returns true when a new definition was activated.
    pub async fn check_and_update(&self) -> Result<bool, SyncError> {
        let advertised = self.transport.check_version().await?;

        if self.store.current_checksum().as_deref() == Some(advertised.checksum.as_str()) {
            debug!(
                checksum = %advertised.checksum,
                "Survey definition unchanged, skipping download"
            );
            return Ok(false);
        }

        let bundle = self.transport.download_definition().await?;
        if bundle.metadata.checksum != advertised.checksum {
            return Err(SyncError::ChecksumMismatch {
                advertised: advertised.checksum,
                actual: bundle.metadata.checksum,
            });
        }

        // replace() re-verifies the checksum against the bundle content
        // before anything is persisted or activated.
        let definition = self.store.replace(bundle)?;
        info!(
            version = definition.version(),
            checksum = %definition.checksum,
            "Activated new survey definition"
        );
        Ok(true)
    }

    /// Poll until shutdown. Failures are logged and retried on the next
    /// tick; a bad poll never takes the interview path down.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check_and_update().await {
                        warn!(error = %e, "Definition sync cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Definition sync stopping");
                        return;
                    }
                }
            }
        }
    }
}
