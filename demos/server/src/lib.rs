//! An HTTP server exposing a [`rescheduler::Scheduler`] and a handful of demo jobs.
pub mod config;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod routes;
pub mod state;
