//! Request Interceptor
//!
//! Decides which policy, if any, handles a request.

use reqwest::Method;

use crate::http::{Request, RequestMode};

/// Header browsers use to carry the fetch mode
pub const FETCH_MODE_HEADER: &str = "sec-fetch-mode";

/// Routing decision for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Not ours to touch: goes to the network as-is
    PassThrough,
    /// Top-level document load: network first, offline document on failure
    Navigation,
    /// Subresource: stale-while-revalidate
    Resource,
}

/// Classify a request
///
/// Only GET is ever intercepted; mutating methods must reach the network
/// exactly once.
pub fn classify(request: &Request) -> Route {
    if request.method != Method::GET {
        return Route::PassThrough;
    }

    let mode = request.mode.unwrap_or_else(|| {
        request
            .header(FETCH_MODE_HEADER)
            .map(RequestMode::parse)
            .unwrap_or(RequestMode::Resource)
    });

    match mode {
        RequestMode::Navigate => Route::Navigation,
        RequestMode::Resource => Route::Resource,
    }
}
