//! Furniture visualizer service: image uploads, streamed workflow generation,
//! and the per-page session state that ties them together.

pub mod config;
pub mod error;
pub mod extract;
pub mod generation;
pub mod history;
pub mod models;
pub mod routes;
pub mod session;
pub mod sse;
pub mod upload;
pub mod workflow;
