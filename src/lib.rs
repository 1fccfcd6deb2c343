pub mod cli;
pub mod config;
pub mod core;
pub mod credential;
pub mod dispatch;
pub mod engine;
pub mod exit;
pub mod logs;
pub mod parser;
pub mod platform;
pub mod probe;
pub mod publish;
pub mod ui;
