pub mod api;
pub mod app;
pub mod capture;
pub mod cli;
pub mod concat;
pub mod config;
pub mod global;
pub mod session;
