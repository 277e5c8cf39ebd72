pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod middleware;
pub mod models;
pub mod permissions;
pub mod routes;
pub mod state;
pub mod store;
pub mod websocket;
