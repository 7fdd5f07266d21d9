// src/core/mod.rs

pub mod commands;
pub mod connection;
pub mod environment;
pub mod fabfile;
pub mod failure;
pub mod host_spec;
pub mod interpolator;
pub mod operation;
pub mod operations;
pub mod orchestrator;
pub mod output;
pub mod settings;
pub mod strategy;
