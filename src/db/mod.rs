//! Database module for fleetwatch.
//!
//! One SQLite store per tenant, reached through the [`TenantRegistry`].

mod alerts;
mod jobs;
mod models;
mod registry;
mod servers;
mod store;

pub use models::*;
pub use registry::*;
pub use store::*;
