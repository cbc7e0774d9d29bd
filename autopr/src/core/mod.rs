//! Deterministic, pure logic shared by the cycle controller.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod branch;
pub mod ledger;
pub mod modes;
pub mod trigger;
pub mod types;
pub mod verdict;
