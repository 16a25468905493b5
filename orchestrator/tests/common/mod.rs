//! Shared test utilities: profile builders, a full in-tempdir stack, and a
//! mock webhook endpoint.

// Allow unused code in test fixtures - they are utilities for future tests
#![allow(dead_code)]
#![allow(unused_imports)]

pub mod fixtures;
