//! Data Transfer Objects for REST request/response serialization.

pub mod appointment_dto;
pub mod task_dto;

pub use appointment_dto::*;
pub use task_dto::*;
