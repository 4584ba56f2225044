//! Core domain types
//!
//! These types describe a rendering job and are shared between the
//! persistent store, the coordinator and the HTTP layer.

pub mod job;
