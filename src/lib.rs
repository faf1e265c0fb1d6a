pub mod app;
pub mod config;
pub mod dataset;
pub mod domain;
pub mod error;
pub mod fetcher;
pub mod listing;
pub mod merger;
pub mod output;
pub mod store;
pub mod tui;
