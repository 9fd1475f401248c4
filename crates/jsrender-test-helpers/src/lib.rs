//! Test utilities and fixtures for jsrender
//!
//! This crate provides shared test helpers that can be used by the
//! integration tests (tests/ directory) of every crate in the workspace.

pub mod fixtures;
pub mod mocks;
