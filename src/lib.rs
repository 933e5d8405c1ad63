pub mod api;
pub mod auth;
pub mod config;
pub mod credstash;
pub mod error;
pub mod keystore;
pub mod kms;
pub mod resource;
