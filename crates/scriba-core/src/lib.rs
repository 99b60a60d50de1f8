//! Shared library for the scriba transcription service.
//!
//! Both binaries link against this crate:
//!
//! ```text
//! scribad (coordinator)          scriba-worker (GPU host)
//!   ├── job queue + reaper         ├── segmenter / decoder / merger
//!   ├── metadata store             ├── coordinator client
//!   └── blob store ◀──────────────▶└── artifact uploader
//!            ▲
//!            └── scriba-core: Job/Segment model, wire protocol,
//!                blob keys, gzip artifact codecs, config, errors
//! ```

pub mod artifact;
pub mod blob;
pub mod config;
pub mod error;
pub mod job;
pub mod protocol;
pub mod segment;
pub mod srt;
pub mod verbose;

pub use blob::BlobStore;
pub use config::{CoordinatorConfig, PipelineConfig, QueueConfig, WorkerConfig};
pub use error::{Result, ScribaError};
pub use job::{JobId, JobRecord, JobStage};
pub use segment::Segment;
pub use verbose::set_verbose;
