pub mod db;
pub mod dedup;
pub mod error;
pub mod memory;
pub mod mirror;
pub mod models;
pub mod service;
pub mod sheets;
pub mod store;
pub mod sync;
