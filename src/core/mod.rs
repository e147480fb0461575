pub mod artifacts;
pub mod config;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod montage;
pub mod pipeline;
pub mod report;
pub mod scheduler;
pub mod terminal;
