//! Ingestion pipeline: one reader task per input source.
//!
//! ```text
//! source ──lines──▶ tee (pass-through) ──▶ classify ──▶ LogStore::append
//!                                                            │
//!                                   WriteEvent (Ok(seq) / Err) ▼
//!                                                     completion channel
//! ```

pub mod error;
pub mod pipeline;
pub mod source;

pub use error::IngestError;
pub use pipeline::{IngestPipeline, WriteEvent, DEFAULT_EVENT_QUEUE};
pub use source::Source;
