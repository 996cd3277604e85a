pub mod capture;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod osc;
pub mod pose;
pub mod producer;
pub mod protocol;
pub mod relay;
