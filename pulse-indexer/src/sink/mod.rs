//! Secondary write targets and their composite.
//!
//! - [`HotBuffer`] - bounded in-memory ring for dashboard reads
//! - [`ArchiveSink`] - append-only gzip-framed archive file
//! - [`MultiSink`] - parallel fan-out over the registered sinks

mod archive;
mod hot_buffer;
mod multi;

pub use archive::ArchiveSink;
pub use hot_buffer::HotBuffer;
pub use multi::MultiSink;
