// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Crate-level tests against in-memory providers
//!
//! This module contains tests for:
//! - The churn scenario, end to end and on its abort paths
//! - Node volume provisioning and teardown
//! - Cleanup guards

#[path = "../common/mod.rs"]
mod common;

mod baremetal;
mod scenario;
