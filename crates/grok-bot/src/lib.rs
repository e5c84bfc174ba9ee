pub mod app;
pub mod bilibili;
pub mod config;
pub mod credentials;
pub mod health;
pub mod llm;
pub mod logging;
