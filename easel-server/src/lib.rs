pub mod api;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod repository;
pub mod service;
pub mod ws;
