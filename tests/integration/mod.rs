//! Integration test suite for cadence.
//!
//! These tests drive whole runs through the engine against local stand-ins
//! for the remote file store and the warehouse.
//!
//! # Test Categories
//!
//! - `taxi_pipeline`: The weekly taxi-trips pipeline end to end
//! - `failure_propagation`: Skips, failure policies and notifications
//! - `sensors`: Wall-clock sensor timing
//! - `context`: Run context guarantees across tasks

mod fixtures;

mod context;
mod failure_propagation;
mod sensors;
mod taxi_pipeline;
