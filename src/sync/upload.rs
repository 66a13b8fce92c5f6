//! Completed-session upload worker.
//!
//! Drains the PENDING queue oldest-first. Transient failures back off
//! exponentially per session; 4xx rejections and exhausted attempt budgets
//! park the row FAILED_TERMINAL for the operator. The payload is rebuilt
//! from the store on every attempt, and the session id is the server-side
//! idempotency key, so a crash between send and acknowledgement costs
//! nothing but a duplicate-flagged retry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use super::{payload, SyncError, SyncTransport};
use crate::coupon::CouponLedger;
use crate::store::SessionDb;

pub struct UploadWorker {
    db: Arc<SessionDb>,
    ledger: Arc<CouponLedger>,
    transport: Arc<dyn SyncTransport>,
    device_id: String,
    max_attempts: u32,
    backoff_base_ms: u64,
    backoff_cap_ms: u64,
}

impl UploadWorker {
    pub fn new(
        db: Arc<SessionDb>,
        ledger: Arc<CouponLedger>,
        transport: Arc<dyn SyncTransport>,
        device_id: &str,
        max_attempts: u32,
        backoff_base_ms: u64,
        backoff_cap_ms: u64,
    ) -> Self {
        Self {
            db,
            ledger,
            transport,
            device_id: device_id.to_string(),
            max_attempts,
            backoff_base_ms,
            backoff_cap_ms,
        }
    }

    /// Rows stranded IN_FLIGHT by a crash go back to PENDING without
    /// consuming an attempt; the idempotency key absorbs any double send.
    pub fn recover(&self) -> Result<(), SyncError> {
        let recovered = self.db.recover_in_flight_uploads()?;
        if recovered > 0 {
            info!(recovered, "Reset in-flight uploads from previous run");
        }
        Ok(())
    }

    /// One queue pass at time `now` (unix seconds). Returns how many
    /// uploads succeeded. Per-session transport failures are recorded on
    /// the row and do not abort the pass; store failures do.
    pub async fn process_due(&self, now: i64) -> Result<usize, SyncError> {
        let due = self.db.due_uploads(now)?;
        let mut succeeded = 0;

        for record in due {
            let session_id = record.session_id.as_str();

            // Assemble before claiming the row: a payload failure must not
            // strand it IN_FLIGHT until the next restart.
            let upload = payload::build_upload(&self.db, &self.ledger, &self.device_id, session_id)?;
            self.db.mark_upload_in_flight(session_id)?;

            match self.transport.upload_session(&upload).await {
                Ok(response) => {
                    if response.duplicate {
                        info!(session_id, "Server already had this session");
                    } else {
                        info!(session_id, "Session uploaded");
                    }
                    self.db.mark_upload_completed(session_id)?;
                    succeeded += 1;
                }
                Err(e) => {
                    let attempts = record.attempts + 1;
                    if e.is_terminal() {
                        warn!(session_id, attempts, error = %e, "Upload rejected by server");
                        self.db.mark_upload_terminal(session_id, attempts, &e.to_string())?;
                    } else if attempts >= self.max_attempts {
                        warn!(session_id, attempts, error = %e, "Upload attempts exhausted");
                        self.db.mark_upload_terminal(session_id, attempts, &e.to_string())?;
                    } else {
                        let delay = self.backoff_delay(attempts);
                        let next = now + delay.as_secs() as i64;
                        warn!(
                            session_id,
                            attempts,
                            retry_in_secs = delay.as_secs(),
                            error = %e,
                            "Upload failed, will retry"
                        );
                        self.db
                            .mark_upload_retry(session_id, attempts, &e.to_string(), next)?;
                    }
                }
            }
        }

        Ok(succeeded)
    }

    /// Delay before attempt `attempts + 1`: base * 2^(attempts - 1),
    /// capped.
    fn backoff_delay(&self, attempts: u32) -> Duration {
        let factor = 1u64 << (attempts.saturating_sub(1)).min(32);
        let ms = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_cap_ms);
        Duration::from_millis(ms)
    }

    /// Poll the queue until shutdown.
    pub async fn run(self, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.recover() {
            warn!(error = %e, "In-flight upload recovery failed");
        }

        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.process_due(Utc::now().timestamp()).await {
                        warn!(error = %e, "Upload queue pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Upload worker stopping");
                        return;
                    }
                }
            }
        }
    }
}
