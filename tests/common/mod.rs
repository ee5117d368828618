//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - MySQL testcontainer setup
//! - Fake engine, producer, extractor and preparer
//! - Snapshot and server helpers

#![allow(dead_code)] // Each test binary uses a different subset

pub mod containers;
pub mod fakes;

pub use containers::*;
pub use fakes::*;
