//! Coupon generation, issuance and redemption.
//!
//! Every completed interview hands out a configured number of coupons; a
//! new participant presents the coupon that recruited them. The inbound
//! code and the outbound codes together reconstruct the recruitment chain
//! for link-tracing analysis, so the ledger guarantees two things: a code
//! is unique for the lifetime of the store, and its status only ever moves
//! UNUSED -> ISSUED -> USED.

use std::sync::Arc;

use chrono::Utc;
use rand::rngs::OsRng;
use rand::Rng;
use rusqlite::{params, OptionalExtension};
use thiserror::Error;
use tracing::info;

use crate::store::{SessionDb, StoreError};

/// Characters that survive handwriting and low-quality printing: no 0/O,
/// 1/I/L, 2/Z, 5/S or 8/B pairs.
pub const CODE_ALPHABET: &[u8] = b"ACDEFGHJKMNPQRTUVWXY34679";

/// Coupon code length.
pub const CODE_LEN: usize = 8;

/// Attempts at generating an unused code before giving up; collisions are
/// vanishingly rare at this alphabet and length, so hitting the bound means
/// something is wrong with the store.
const MAX_GENERATION_ATTEMPTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouponStatus {
    Unused,
    Issued,
    Used,
}

impl CouponStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CouponStatus::Unused => "UNUSED",
            CouponStatus::Issued => "ISSUED",
            CouponStatus::Used => "USED",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "UNUSED" => Some(CouponStatus::Unused),
            "ISSUED" => Some(CouponStatus::Issued),
            "USED" => Some(CouponStatus::Used),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Coupon {
    pub code: String,
    pub status: CouponStatus,
    pub issued_to_session: Option<String>,
    pub issued_at: Option<i64>,
    pub used_by_session: Option<String>,
    pub used_at: Option<i64>,
}

#[derive(Debug, Error)]
pub enum CouponError {
    #[error("coupon not found: {0}")]
    NotFound(String),

    #[error("coupon {0} has not been issued")]
    NotIssued(String),

    #[error("coupon {code} was already redeemed by session {by}")]
    AlreadyUsed { code: String, by: String },

    #[error("could not generate a unique coupon code")]
    GenerationExhausted,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Device-local coupon ledger backed by the session store. Code generation
/// and the uniqueness check run inside one transaction, so check-then-issue
/// is atomic with respect to other issuance on this device.
pub struct CouponLedger {
    db: Arc<SessionDb>,
}

impl CouponLedger {
    pub fn new(db: Arc<SessionDb>) -> Self {
        Self { db }
    }

    /// Pre-generate a batch of UNUSED codes, e.g. for printing physical
    /// coupons ahead of time.
    pub fn mint(&self, count: u32) -> Result<Vec<String>, CouponError> {
        let codes = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut codes = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let code = generate_unique_code(&tx)
                    .map_err(|e| StoreError::Internal(e.to_string()))?;
                tx.execute(
                    "INSERT INTO coupons (code, status) VALUES (?1, 'UNUSED')",
                    params![code],
                )?;
                codes.push(code);
            }
            tx.commit()?;
            Ok(codes)
        })?;
        Ok(codes)
    }

    /// Issue `count` coupons to a session. Pre-minted UNUSED codes are
    /// consumed first (guarded UPDATE, so UNUSED -> ISSUED happens at most
    /// once per code); any shortfall is generated fresh. Everything runs in
    /// a single transaction, so check-then-issue is atomic.
    pub fn issue(&self, session_id: &str, count: u32) -> Result<Vec<String>, CouponError> {
        let issued_at = Utc::now().timestamp();
        let codes = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut codes: Vec<String> = Vec::with_capacity(count as usize);

            let unused: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT code FROM coupons WHERE status = 'UNUSED' ORDER BY code LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map([count], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };
            for code in unused {
                let n = tx.execute(
                    "UPDATE coupons
                     SET status = 'ISSUED', issued_to_session = ?1, issued_at = ?2
                     WHERE code = ?3 AND status = 'UNUSED'",
                    params![session_id, issued_at, code],
                )?;
                if n == 1 {
                    codes.push(code);
                }
            }

            while codes.len() < count as usize {
                let code = generate_unique_code(&tx)
                    .map_err(|e| StoreError::Internal(e.to_string()))?;
                tx.execute(
                    "INSERT INTO coupons (code, status, issued_to_session, issued_at)
                     VALUES (?1, 'ISSUED', ?2, ?3)",
                    params![code, session_id, issued_at],
                )?;
                codes.push(code);
            }
            tx.commit()?;
            Ok(codes)
        })?;

        info!(session_id, count = codes.len(), "Issued recruitment coupons");
        Ok(codes)
    }

    /// Redeem a coupon presented by a new participant. The guarded UPDATE
    /// makes ISSUED -> USED exactly-once; a second redemption attempt fails
    /// with the session that got there first.
    pub fn redeem(&self, code: &str, session_id: &str) -> Result<(), CouponError> {
        let updated = self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE coupons
                 SET status = 'USED', used_by_session = ?1, used_at = ?2
                 WHERE code = ?3 AND status = 'ISSUED'",
                params![session_id, Utc::now().timestamp(), code],
            )?;
            Ok(n)
        })?;

        if updated == 1 {
            info!(code, session_id, "Referral coupon redeemed");
            return Ok(());
        }

        // Nothing transitioned; look the coupon up to say why.
        match self.lookup(code)? {
            Coupon {
                status: CouponStatus::Used,
                used_by_session: Some(by),
                ..
            } => Err(CouponError::AlreadyUsed {
                code: code.to_string(),
                by,
            }),
            Coupon {
                status: CouponStatus::Unused,
                ..
            } => Err(CouponError::NotIssued(code.to_string())),
            _ => Err(CouponError::NotFound(code.to_string())),
        }
    }

    pub fn lookup(&self, code: &str) -> Result<Coupon, CouponError> {
        let row = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT code, status, issued_to_session, issued_at,
                            used_by_session, used_at
                     FROM coupons WHERE code = ?1",
                    [code],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, Option<i64>>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, Option<i64>>(5)?,
                        ))
                    },
                )
                .optional()?)
        })?;

        let (code, status_text, issued_to_session, issued_at, used_by_session, used_at) =
            row.ok_or_else(|| CouponError::NotFound(code.to_string()))?;
        let status = CouponStatus::parse(&status_text)
            .ok_or_else(|| StoreError::Internal(format!("unknown coupon status: {status_text}")))?;

        Ok(Coupon {
            code,
            status,
            issued_to_session,
            issued_at,
            used_by_session,
            used_at,
        })
    }

    /// Coupons issued by a session, in issuance order.
    pub fn issued_by(&self, session_id: &str) -> Result<Vec<String>, CouponError> {
        let codes = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT code FROM coupons WHERE issued_to_session = ?1 ORDER BY issued_at, code",
            )?;
            let rows = stmt
                .query_map([session_id], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(rows)
        })?;
        Ok(codes)
    }
}

fn generate_code() -> String {
    let mut rng = OsRng;
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

fn generate_unique_code(tx: &rusqlite::Transaction<'_>) -> Result<String, CouponError> {
    for _ in 0..MAX_GENERATION_ATTEMPTS {
        let code = generate_code();
        let exists: bool = tx
            .query_row(
                "SELECT 1 FROM coupons WHERE code = ?1",
                [&code],
                |_| Ok(true),
            )
            .optional()
            .map_err(StoreError::from)?
            .unwrap_or(false);
        if !exists {
            return Ok(code);
        }
    }
    Err(CouponError::GenerationExhausted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ledger() -> CouponLedger {
        CouponLedger::new(Arc::new(SessionDb::open_in_memory("pass").unwrap()))
    }

    #[test]
    fn test_codes_use_constrained_alphabet() {
        for _ in 0..50 {
            let code = generate_code();
            assert_eq!(code.len(), CODE_LEN);
            assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)), "{code}");
        }
    }

    #[test]
    fn test_issued_codes_are_unique() {
        let ledger = ledger();
        let mut seen = HashSet::new();
        for i in 0..20 {
            for code in ledger.issue(&format!("session-{i}"), 3).unwrap() {
                assert!(seen.insert(code));
            }
        }
        assert_eq!(seen.len(), 60);
    }

    #[test]
    fn test_redeem_is_exactly_once() {
        let ledger = ledger();
        let codes = ledger.issue("recruiter", 1).unwrap();
        let code = &codes[0];

        ledger.redeem(code, "recruit-a").unwrap();

        let err = ledger.redeem(code, "recruit-b").unwrap_err();
        assert!(matches!(err, CouponError::AlreadyUsed { ref by, .. } if by == "recruit-a"));

        let coupon = ledger.lookup(code).unwrap();
        assert_eq!(coupon.status, CouponStatus::Used);
        assert_eq!(coupon.used_by_session.as_deref(), Some("recruit-a"));
        assert_eq!(coupon.issued_to_session.as_deref(), Some("recruiter"));
    }

    #[test]
    fn test_issue_consumes_minted_codes_first() {
        let ledger = ledger();
        let minted = ledger.mint(2).unwrap();
        assert_eq!(
            ledger.lookup(&minted[0]).unwrap().status,
            CouponStatus::Unused
        );

        let issued = ledger.issue("s1", 3).unwrap();
        assert_eq!(issued.len(), 3);
        for code in &minted {
            assert!(issued.contains(code));
            assert_eq!(ledger.lookup(code).unwrap().status, CouponStatus::Issued);
        }
    }

    #[test]
    fn test_unused_code_cannot_be_redeemed() {
        let ledger = ledger();
        let minted = ledger.mint(1).unwrap();
        assert!(matches!(
            ledger.redeem(&minted[0], "s1"),
            Err(CouponError::NotIssued(_))
        ));
    }

    #[test]
    fn test_redeem_unknown_code() {
        let ledger = ledger();
        assert!(matches!(
            ledger.redeem("NOPE", "s1"),
            Err(CouponError::NotFound(_))
        ));
    }

    #[test]
    fn test_issued_by_reconstructs_outbound_links() {
        let ledger = ledger();
        let codes = ledger.issue("recruiter", 3).unwrap();
        let mut listed = ledger.issued_by("recruiter").unwrap();
        let mut expected = codes.clone();
        listed.sort();
        expected.sort();
        assert_eq!(listed, expected);
    }
}
