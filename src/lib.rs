pub mod app;
pub mod config;
pub mod logger;
pub mod registry;
pub mod router;
pub mod web;
