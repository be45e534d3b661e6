pub mod api;
pub mod config;
pub mod control;
pub mod db;
pub mod error;
pub mod reading_cache;
pub mod retention;
pub mod sensors;
pub mod store;
