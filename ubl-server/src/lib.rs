//! # UBL Server
//!
//! The §6 wire API over `ubl-commit`/`ubl-ledger`/`ubl-tail`: a thin axum
//! surface that canonicalizes nothing and decides nothing itself, only
//! translating HTTP requests into core calls and core outcomes into HTTP
//! responses.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod app;
pub mod verify;
