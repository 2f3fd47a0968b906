//! Process wiring for the inscription worker binary.

pub mod app;
pub mod config;
