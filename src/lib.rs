pub mod api;
pub mod chat;
pub mod config;
pub mod entity;
pub mod error;
pub mod session;
pub mod store;
