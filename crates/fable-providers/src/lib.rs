//! Provider gateway access with fallback chains and circuit breaking.
//!
//! This crate provides:
//! - Typed provider requests/responses and the adapter trait
//! - An HTTP adapter for the provider gateway
//! - Ordered fallback chains per capability and plan tier
//! - Per-(capability, provider) circuit breakers
//! - The selector that walks a chain until a candidate delivers

pub mod adapter;
pub mod catalog;
pub mod circuit;
pub mod error;
pub mod http;
pub mod selector;

pub use adapter::{ProviderAdapter, ProviderRequest, ProviderResponse};
pub use catalog::{CatalogError, FallbackCatalog};
pub use circuit::{Acquire, CircuitBreaker, CircuitConfig, CircuitRegistry, CircuitState};
pub use error::{AttemptRecord, ExhaustedError, ProviderError, ProviderResult};
pub use http::HttpProviderAdapter;
pub use selector::{FallbackSelector, SelectorOutcome};
