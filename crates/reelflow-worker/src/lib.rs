mod gate;
mod pipeline;
mod worker;

pub use gate::{Admission, KlingPermit, WorkerGate, QUOTA_STDERR_MARKERS};
pub use pipeline::{Dispatcher, PipelineConfig, StageKind, StageOutcome, StageRun, StageSettings};
pub use worker::{WorkerConfig, WorkerLoop};
