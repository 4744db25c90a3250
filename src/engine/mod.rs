pub mod pipeline;

pub use pipeline::{SignalPipeline, DEFAULT_HISTORY_CAPACITY};
