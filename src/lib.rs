pub mod config;
pub mod database;
pub mod errors;
pub mod handlers;
pub mod middleware;
#[cfg(any(test, feature = "test-support"))]
pub mod mocks;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
