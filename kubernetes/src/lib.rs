pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod fixture;
pub mod metrics;
pub mod util;
