pub mod client;
pub mod config;
pub mod generator;
pub mod message;
pub mod metrics;
pub mod output;
pub mod template;
pub mod transport;
pub mod worker;
