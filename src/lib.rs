#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod alsa;
pub mod compressor;
pub mod correlation;
pub mod db;
pub mod device;
pub mod filter;
pub mod loudness;
pub mod mapping;
pub mod metrics;
pub mod mixer;
pub mod prelude;
pub mod resampler;
pub mod settings;
