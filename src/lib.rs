//! Library exports for the site API
//!
//! This module exposes internal components for testing and potential library usage.

pub mod alt_text;
pub mod config;
pub mod database;
pub mod document;
pub mod error;
pub mod handler;
pub mod input;
pub mod kv;
pub mod metrics;
pub mod middleware;
pub mod model;
pub mod optimiser;
pub mod permission;
pub mod redirect;
pub mod report;
pub mod response;
pub mod route;
pub mod search;
pub mod state;
pub mod tasks;
pub mod token;
