//! Runtime module
//!
//! This module provides the container runtime capabilities the injector
//! consumes through the RuntimeAdapter trait.

pub mod adapter;
pub mod docker;

#[cfg(test)]
pub(crate) mod fake;
