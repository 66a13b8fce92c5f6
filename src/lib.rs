//! tracelink: offline-first interview runtime for facility tablets.
//!
//! Runs self-administered surveys at field facilities with no network
//! dependency on the interview path: definitions are cached locally,
//! sessions and answers are committed to an encrypted on-device store
//! before the flow advances, and completed sessions drain to the central
//! server in the background with retry. Biometric duplicate screening
//! gates enrollment, and a coupon ledger carries the recruitment chain.
//!
//! Module map:
//! - [`expr`]: the script language used by skip, validation and
//!   eligibility rules
//! - [`definition`]: survey bundle model, checksum and local cache
//! - [`store`]: encrypted SQLite persistence
//! - [`biometric`]: capture device contract and screening gate
//! - [`coupon`]: recruitment coupon ledger
//! - [`session`]: the interview state machine
//! - [`sync`]: definition pull and session upload workers

pub mod biometric;
pub mod config;
pub mod coupon;
pub mod definition;
pub mod expr;
pub mod session;
pub mod store;
pub mod sync;
