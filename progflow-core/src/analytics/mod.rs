pub mod bus;
pub mod recorder;
pub mod sink;
pub mod types;

pub use bus::{EventBus, RunEvents};
pub use recorder::{DebugRecorder, RecordingOptions, RunTracer};
pub use sink::{FileTraceSink, TraceSink};
pub use types::{ProgramAnalytics, RunSummary, TraceEvent, TraceEventKind};
