//! API client module for Microsoft Teams

pub mod client;

pub use client::{ApiError, TeamsClient, TeamsClientFactory};
