//! Ingress middleware for throttling inbound requests.
//!
//! Provides a Tower-compatible layer for Axum applications.
//!
//! The layered service is fallible (its error type is `BoxError`, so that
//! propagation signals can travel through it); in an Axum router, mount it
//! behind `HandleErrorLayer` like any other fallible Tower middleware.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use axum::{Router, routing::get, error_handling::HandleErrorLayer, http::StatusCode};
//! use tower::{BoxError, ServiceBuilder};
//! use gatelimit::{
//!     Config, ConfigLoader, Engine, FixedWindow, IngressLayer, MemoryCounterStore, Rule,
//! };
//!
//! let config = Config::new().with_rule(Rule::new(FixedWindow::new(100, 60)));
//! let engine = Arc::new(Engine::new(
//!     ConfigLoader::fixed(config),
//!     Arc::new(MemoryCounterStore::new()),
//! ));
//!
//! let app: Router = Router::new()
//!     .route("/api/data", get(handler))
//!     .layer(
//!         ServiceBuilder::new()
//!             .layer(HandleErrorLayer::new(|_: BoxError| async {
//!                 StatusCode::INTERNAL_SERVER_ERROR
//!             }))
//!             .layer(IngressLayer::new(engine)),
//!     );
//! ```

mod ingress;

pub use ingress::{IngressLayer, IngressOverride, IngressResponseBuilder, IngressService};
