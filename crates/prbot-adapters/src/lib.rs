//! Runtime adapters for prbot (configuration, GitHub REST).

pub mod config;
pub mod github;

pub use config::Settings;
pub use github::{GitHubClient, Permission};
