pub mod admin;
pub mod app;
pub mod auth;
pub mod chat;
pub mod config;
pub mod contact;
pub mod engine;
pub mod error;
pub mod realtime;
pub mod replies;
pub mod repository;
pub mod session_store;
pub mod site;
pub mod telemetry;
pub mod timestamp;
pub mod types;
