// Library entrypoint for integration tests and the server binary.
pub mod api;
pub mod auth;
pub mod chat;
pub mod config;
pub mod error;
pub mod llm;
pub mod queue;
pub mod shutdown;
pub mod sqlgen;
pub mod state;
pub mod storage;
pub mod userdb;
