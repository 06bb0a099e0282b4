//! services/api/src/lib.rs
//!
//! The tinyquiz service: repository adapters, the broadcast hub, the service layer
//! and the HTTP/WebSocket surface.

pub mod adapters;
pub mod config;
pub mod error;
pub mod hub;
pub mod service;
pub mod web;
