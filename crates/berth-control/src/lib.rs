pub mod config;
pub mod error_payload;
pub mod hub;
pub mod routes;
pub mod state;
