//! HTTP surfaces exposed by the controller.

pub mod jobs_http;

pub use jobs_http::{ApiState, ErrorResponse, JobResponse, JobsHttpServer};
