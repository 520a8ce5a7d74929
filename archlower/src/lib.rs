pub mod codegen;
pub mod common;
pub mod config;
pub mod error;
pub mod lower;
pub mod planner;
pub mod pprint;
pub mod registry;
pub mod sample;
pub mod shape;
pub mod syntax;
pub mod utils;

pub use config::PipelineConfig;
pub use error::CompileError;
pub use lower::{compile, compile_str, PipelinePlan};
