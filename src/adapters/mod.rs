//! Adapters implementing the domain ports against real and in-process systems.

pub mod catalog_http;
pub mod http;
pub mod memory;
pub mod process;
pub mod sqlite;

pub use catalog_http::HttpCatalogClient;
pub use process::{ProcessJobManager, ProcessJobManagerConfig, PROCESS_RUNNER};
