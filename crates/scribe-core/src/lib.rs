pub mod actions;
pub mod atomic;
pub mod breaker;
pub mod config;
pub mod dispatcher;
pub mod metrics;
pub mod plugins;
pub mod rules;
pub mod security;
