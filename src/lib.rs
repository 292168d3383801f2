pub mod api;
pub mod config;
pub mod controller;
pub mod domain;
pub mod measurements;
pub mod registry;
pub mod telemetry;
pub mod transport;
