//! Shared infrastructure for beak.
//!
//! This crate holds the pieces every other beak crate builds on: the
//! process-wide [`path`] interner with its comparison predicates in
//! [`order`], the [`fs`] capability that abstracts all operating system
//! file access, and the [`system`] capability for driving external
//! programs.

pub mod fs;
pub mod order;
pub mod path;
pub mod system;
