pub mod cluster;
pub mod config;
pub mod controller;
pub mod errors;
pub mod exceptions;
pub mod logging;
pub mod metrics;
pub mod percentiles;
pub mod protocol;
pub mod ramp;
pub mod report;
pub mod runner;
pub mod scenario;
pub mod scenario_file;
pub mod selector;
pub mod shutdown;
pub mod standalone;
pub mod state;
pub mod stats;
pub mod user;
pub mod utils;
pub mod web;
pub mod worker;
