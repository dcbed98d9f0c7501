#![forbid(unsafe_code)]

pub mod broadcast;
pub mod connection;
pub mod directory;
pub mod health;
pub mod identity;
pub mod resolver;
pub mod session;
pub mod store;
