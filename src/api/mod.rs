//! HTTP API Module
//!
//! REST surface for the administrative layer.

mod http;

pub use http::HttpServer;
