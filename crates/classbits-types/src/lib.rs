//! Shared model, API and event types for the classbits workspace.

pub mod api;
pub mod events;
pub mod models;
