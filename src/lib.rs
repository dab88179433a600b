pub mod api;
pub mod cli;
pub mod commands;
pub mod config;
pub mod health;
pub mod logs;
pub mod platform;
pub mod ports;
pub mod process;
pub mod registry;
pub mod supervisor;
pub mod ui;
