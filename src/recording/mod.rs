//! Recording engine for capturing live sensor streams

mod queue;
mod recorder;
mod stream;
mod writer;

pub use queue::{Priority, PriorityQueue};
pub use recorder::Recorder;
pub use stream::{Frame, RecordableStream, StreamDescriptor};
