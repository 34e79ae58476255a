//! JSON wire messages at the engine boundary.

pub mod mappers;
pub mod models;
