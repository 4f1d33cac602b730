pub mod config;
pub mod errors;
pub mod logging;
pub mod search;
pub mod server;
pub mod store;
