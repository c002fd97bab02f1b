pub mod application;
pub mod archive;
pub mod catalogue;
pub mod commands;
pub mod config;
pub mod definition;
pub mod download;
pub mod error;
pub mod http;
pub mod lock;
pub mod matcher;
pub mod package;
pub mod resolver;
pub mod runtime;
pub mod tasks;
pub mod trash;
