//! Query engine: the remote capability and its caller-side client

pub mod client;
pub mod decode;
pub mod processor;

pub use client::{EngineChannel, EngineState, QueryEngineClient};
pub use decode::{decode_buckets, decode_slices, decode_threads, ThreadInfo, UtilizationBucket};
pub use processor::{process_color, TraceProcessor, ENGINE_NAME};
