//! HTTP request/response model and network transport

pub mod client;
pub mod errors;
pub mod types;

pub use client::{ErrorEntry, HttpNetwork, Network, REQUEST_TIMEOUT};
pub use errors::NetworkError;
pub use types::*;
