//! Easel Core
//!
//! Core types shared by the Easel render queue.
//!
//! This crate contains:
//! - Domain types: the Job entity and its lifecycle state machine
//! - DTOs: HTTP bodies and WebSocket frames exchanged with observers

pub mod domain;
pub mod dto;
