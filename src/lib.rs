//! Analytics relay library exports

pub mod buffer;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod filter;
pub mod governor;
pub mod hash;
pub mod metadata;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod provider;
pub mod redis_backend;
pub mod reliability;
pub mod routes;
pub mod state;
pub mod store;
pub mod tasks;
