//! Core domain types
//!
//! This module contains the core domain structures used across Pipewright.
//! These types represent the fundamental business entities and are shared between
//! the run store (for persistence) and the scheduler (for dispatch).

pub mod pipeline;
pub mod run;
pub mod schedule;
