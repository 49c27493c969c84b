//! # Rankforge Core
//!
//! Training orchestration and parameter-efficient model adaptation.
//! Provides the session orchestrator, the training loop driver, three
//! weight-adaptation strategies (magnitude/direction decomposition,
//! quantized low-rank factorization and a small sequence classifier),
//! checkpointing and session storage.

pub mod adapters;
pub mod config;
pub mod data;
pub mod decomposition;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod persistence;
pub mod quantize;
pub mod tensor;
pub mod training;

// Re-export commonly used types at the crate root.
pub use adapters::{
    AdapterReport, AdapterState, ClassifierSummary, CompressionAnalysis, DoraAdapter, ModelAdapter,
    Prediction, QuantizedRankAdapter, SequenceClassifierAdapter, create_adapter,
};
pub use config::{EngineConfig, load_config};
pub use data::{Dataset, TrainingData};
pub use error::EngineError;
pub use model::{BaseModel, Layer};
pub use orchestrator::{Orchestrator, TrainingInputs};
pub use persistence::{InMemoryStore, JsonFileStore, SessionStore};
pub use tensor::{BufferTracker, TensorData};
pub use training::{
    CheckpointRef, LoggingCallback, ModelCheckpoint, ModelConfiguration, ModelType, NoopCallback,
    RecordingCallback, RunEnd, TrainingCallback, TrainingMetrics, TrainingProgress, TrainingSession,
    TrainingStatus,
};
