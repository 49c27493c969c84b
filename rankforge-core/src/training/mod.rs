//! Sessions, progress, checkpoints and the shared training loop.

pub mod callbacks;
pub mod checkpoint;
pub mod driver;
pub mod optimizer;
pub mod progress;
pub mod session;

pub use callbacks::{LoggingCallback, NoopCallback, RecordingCallback, RunEnd, TrainingCallback};
pub use checkpoint::{CheckpointRef, ModelCheckpoint};
pub use driver::{ProgressSink, RunContext, RunOutcome, SharedAdapter};
pub use optimizer::{LrScheduler, Optimizer};
pub use progress::{AdapterMetrics, MetricsTracker, TrainingMetrics, TrainingProgress};
pub use session::{
    BertConfig, DoraConfig, ModelConfiguration, ModelType, OptimizerKind, QrConfig, SchedulerKind,
    TrainingSession, TrainingStatus,
};
