//! Data Transfer Objects for run store communication
//!
//! Requests to create run records and partial updates applied to them.
//! Updates know how to apply themselves so every store implementation
//! mutates records the same way.

pub mod run;
