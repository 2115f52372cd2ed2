//! Integration tests for the diagnostic request manager
//!
//! The tests drive a [`drm_core::RequestManager`] through its public API
//! only. A recording transport stands in for the bus; the tests play the
//! ECU side by calling the transport callbacks directly.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p drm-tests
//! RUST_LOG=drm_core=trace cargo test -p drm-tests -- --nocapture
//! ```
//!
//! # Test Structure
//!
//! - `request_test.rs` - Single request protocol: P2, response pending, SPRMIB
//! - `functional_test.rs` - Functional requests and the response pool
//! - `discovery_test.rs` - ECU discovery and the persisted table
//! - `arbitration_test.rs` - Tester mode, cancellation, firewall, channel pool
//! - `delay_test.rs` - Request delay schemes

// This crate only contains tests, no library code
