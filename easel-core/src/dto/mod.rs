//! Data Transfer Objects
//!
//! Lightweight representations of domain entities used on the wire:
//! JSON bodies for the HTTP API and frames for observer WebSockets.

pub mod job;
pub mod ws;
