pub mod api;
pub mod app;
pub mod config;
pub mod events;
pub mod feed;
pub mod location;
pub mod logging;
pub mod models;
pub mod schedule;
pub mod session;
pub mod stream;
pub mod ui;
