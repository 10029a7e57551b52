pub mod batch;
pub mod command;
pub mod config;
pub mod db;
pub mod error;
pub mod feedback;
pub mod filename;
pub mod formatter;
pub mod model;
pub mod preflight;
pub mod reconcile;
pub mod records;
pub mod state;
pub mod transfer;
pub mod transport;
