#![doc = include_str!("../README.md")]

pub mod batch;
pub mod cli;
pub mod errors;
pub mod formats;
pub mod liftover;
pub mod normalize;
pub mod output;
pub mod pipeline;
pub mod reference;
pub mod report;
pub mod variant;

pub use pipeline::{ConvertConfig, Converter, DEFAULT_BATCH_SIZE, SYSTEM_ASSEMBLY};
pub use report::{ConversionStats, RunSummary};
