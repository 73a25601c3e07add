//! Pipewright Core
//!
//! Core types and abstractions for the Pipewright pipeline scheduler.
//!
//! This crate contains:
//! - Domain types: Core business entities (Pipeline, PipelineSchedule, PipelineRun, BlockRun)
//! - DTOs: Record creation and partial update requests exchanged with a run store

pub mod domain;
pub mod dto;
