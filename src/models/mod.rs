//! Data models for Teams entities

mod chat;

pub use chat::*;
