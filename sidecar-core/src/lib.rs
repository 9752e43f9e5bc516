//! The async control plane: priority queue with bounded concurrency,
//! cancellation, retry, and upstream-health cooldowns; the envelope/review
//! builder; the error taxonomy; the state resolver; and the replay
//! harness. Decoupled from HTTP and from any concrete upstream transport —
//! the `sidecar` binary crate wires those in.

pub mod envelope;
pub mod error;
pub mod facade;
pub mod health;
pub mod metrics;
pub mod queue;
pub mod replay;
pub mod state;
pub mod upstream;

pub use envelope::{build_envelope, build_review_payload, JobEnvelope, ReviewPayload};
pub use error::{classify_upstream_error, ClassifiedError, ErrorCode};
pub use facade::ControlPlaneFacade;
pub use metrics::MetricsStore;
pub use queue::config::QueueConfig;
pub use queue::manager::AsyncQueueManager;
pub use replay::ReplayHarness;
pub use state::{resolve_state, OperationalState, StateResolution};
pub use upstream::ChatClient;
