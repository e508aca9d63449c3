//! Crate-level scenario tests
//!
//! End-to-end runs of the assembled system against a scratch git
//! repository: the happy path, the quality gate, danger blocking,
//! resource emergencies, and rollback after failure.


#[cfg(test)]
mod night_session_tests;
