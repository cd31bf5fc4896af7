pub mod auth;
pub mod extract;
pub mod server;

pub use server::ApiServer;
