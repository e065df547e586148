pub mod acme_client;
pub mod auth;
pub mod config;
pub mod logging;
