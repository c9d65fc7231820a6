//! Library half of `runwayd`, split out so the wiring can be exercised from
//! integration tests.

pub mod infra;
