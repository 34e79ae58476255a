pub mod domain;
pub mod engine;
pub mod pipeline;
pub mod policy;
pub mod registry;
pub mod traits;
pub mod value;
