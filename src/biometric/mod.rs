//! Duplicate screening against the biometric capture device.
//!
//! The vendor SDK is consumed strictly through the [`BiometricDevice`]
//! contract: initialize, capture (bounded, quality-thresholded), match,
//! close. The engine only ever sees opaque template bytes. Templates are
//! stored encrypted on the originating device and are never part of any
//! upload payload — that is a hard security invariant of the system, not a
//! transport optimization.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::store::{ConfirmedBy, SessionDb, StoreError};

/// A comparison at or above this score is a match. Fixed by the capture
/// hardware's operating point, not configurable.
pub const MATCH_THRESHOLD: u32 = 50;

const SECONDS_PER_DAY: i64 = 86_400;

/// Capture/match contract of the external biometric device.
#[async_trait]
pub trait BiometricDevice: Send + Sync {
    /// Returns false when no device is attached or it fails to start.
    async fn initialize(&self) -> bool;

    /// Capture a template. Returns `None` on timeout, low quality, or a
    /// missing device — never an error the caller has to unwind from.
    async fn capture(&self, timeout: Duration, min_quality: u8) -> Option<Vec<u8>>;

    /// Similarity score between two templates.
    fn match_score(&self, a: &[u8], b: &[u8]) -> u32;

    async fn close(&self);
}

#[derive(Debug, Error)]
pub enum ScreeningError {
    #[error("biometric device unavailable")]
    DeviceUnavailable,

    #[error("biometric capture failed or timed out")]
    CaptureFailed,

    #[error("participant already enrolled, {days_remaining} days remaining in re-enrollment window")]
    Duplicate { days_remaining: i64 },

    #[error("identity could not be confirmed")]
    NotConfirmed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Gates session entry (duplicate screening) and payment confirmation
/// (identity match).
pub struct ScreeningGate {
    device: Arc<dyn BiometricDevice>,
    db: Arc<SessionDb>,
    capture_timeout: Duration,
    min_quality: u8,
    window_days: i64,
}

impl ScreeningGate {
    pub fn new(
        device: Arc<dyn BiometricDevice>,
        db: Arc<SessionDb>,
        capture_timeout: Duration,
        min_quality: u8,
        window_days: i64,
    ) -> Self {
        Self {
            device,
            db,
            capture_timeout,
            min_quality,
            window_days,
        }
    }

    /// Capture with a hard upper bound: even a misbehaving device driver
    /// cannot stall the interview past the configured timeout plus a small
    /// grace period. Expiry yields `None`, not an escaping error.
    async fn bounded_capture(&self) -> Option<Vec<u8>> {
        let outer = self.capture_timeout + Duration::from_secs(2);
        match tokio::time::timeout(
            outer,
            self.device.capture(self.capture_timeout, self.min_quality),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!("Biometric capture exceeded its deadline");
                None
            }
        }
    }

    /// Screen a new enrollment. On success the captured template is stored
    /// for the subject and returned; on a match within the re-enrollment
    /// window the session is blocked before any question is asked.
    pub async fn screen_enrollment(&self, subject_id: &str) -> Result<Vec<u8>, ScreeningError> {
        if !self.device.initialize().await {
            return Err(ScreeningError::DeviceUnavailable);
        }

        let captured = self
            .bounded_capture()
            .await
            .ok_or(ScreeningError::CaptureFailed)?;

        let now = Utc::now().timestamp();
        let cutoff = now - self.window_days * SECONDS_PER_DAY;

        for row in self.db.templates_since(cutoff)? {
            let score = self.device.match_score(&captured, &row.template);
            if score >= MATCH_THRESHOLD {
                let elapsed_days = (now - row.created_at) / SECONDS_PER_DAY;
                let days_remaining = (self.window_days - elapsed_days).max(0);
                info!(
                    subject_id,
                    score, days_remaining, "Duplicate enrollment blocked"
                );
                return Err(ScreeningError::Duplicate { days_remaining });
            }
        }

        self.db
            .insert_template(subject_id, "participant", &captured, now)?;
        info!(subject_id, "Enrollment template stored");
        Ok(captured)
    }

    /// Confirm the identity collecting payment: the participant's own
    /// template, or an administrator's as an explicit override. The
    /// confirming identity is recorded with the payment.
    pub async fn confirm_identity(&self, subject_id: &str) -> Result<ConfirmedBy, ScreeningError> {
        if !self.device.initialize().await {
            return Err(ScreeningError::DeviceUnavailable);
        }

        let captured = self
            .bounded_capture()
            .await
            .ok_or(ScreeningError::CaptureFailed)?;

        if let Some(own) = self.db.template_for_subject(subject_id)? {
            if self.device.match_score(&captured, &own.template) >= MATCH_THRESHOLD {
                return Ok(ConfirmedBy::Participant);
            }
        }

        for admin in self.db.admin_templates()? {
            if self.device.match_score(&captured, &admin.template) >= MATCH_THRESHOLD {
                info!(admin = %admin.subject_id, "Payment confirmed by admin override");
                return Ok(ConfirmedBy::Admin(admin.subject_id));
            }
        }

        Err(ScreeningError::NotConfirmed)
    }

    /// Enroll an administrator template for payment overrides.
    pub async fn enroll_admin(&self, admin_name: &str) -> Result<(), ScreeningError> {
        if !self.device.initialize().await {
            return Err(ScreeningError::DeviceUnavailable);
        }
        let captured = self
            .bounded_capture()
            .await
            .ok_or(ScreeningError::CaptureFailed)?;
        self.db
            .insert_template(admin_name, "admin", &captured, Utc::now().timestamp())?;
        Ok(())
    }

    pub async fn close(&self) {
        self.device.close().await;
    }
}
