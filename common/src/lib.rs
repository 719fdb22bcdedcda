pub mod backends;
pub mod claims;
pub mod models;
mod secrets;

pub use secrets::Secret;

/// Base path under which every service mounts its API.
pub const API_BASE: &str = "/api/v1";
