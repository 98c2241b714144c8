//! HTTP server providing the admin API.
//!
//! - [`admin_api`]: response types, route handlers and the router

pub mod admin_api;
