//! Floodgate - Asynchronous Admission Rate Limiting
//!
//! This crate implements an in-process asynchronous admission limiter for
//! traffic-shaping layers: callers submit completion callbacks representing
//! units of work, and the limiter dispatches them no faster than a
//! configurable, dynamically adjustable rate. Rate increases can be ramped
//! smoothly over time, and cancellation irreversibly drains every queued and
//! future callback through its error path so no work is ever lost silently.

pub mod buffer;
pub mod config;
pub mod error;
pub mod limiter;
