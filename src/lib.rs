pub mod config;
pub mod features;
pub mod isolation;
pub mod model;
pub mod oauth;
pub mod router;
pub mod server;
pub mod sink;
pub mod stats;
pub mod webhook;
