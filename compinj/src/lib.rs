pub mod crash;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod harness;
pub mod inject;
pub mod isolate;
pub mod metrics;
pub mod mode;
pub mod snr;
pub mod sweep;
pub mod tensor;

pub use engine::{Compressor, EngineMetrics};
pub use error::{ConfigError, EngineError, HarnessError, TensorError};
pub use harness::{CycleStats, Harness, RunOutcome, RunReport};
pub use inject::{inject, InjectionSite};
pub use isolate::IsolatedSweep;
pub use metrics::{Evaluation, Evaluator, Metrics};
pub use mode::{CompressorKind, ErrorBound};
pub use snr::{windowed_snr, SnrReport, SnrWindow};
pub use sweep::{Summary, Sweep, TrialRecord, TrialStatus};
pub use tensor::{Shape, Tensor};
