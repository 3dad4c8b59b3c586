//! BlockDeviceClaim controller
//!
//! - Validation: requirement checks for claims
//! - Selection: first-fit device matching
//! - Binding: device-then-claim bind writes
//! - Release: returning devices of deleted claims to the pool
//! - Reconciler: the per-claim state machine
//! - Dispatcher: watch-driven work queue and worker pool
//! - Metrics: Prometheus collectors

pub mod binding;
pub mod dispatcher;
pub mod metrics;
pub mod reconciler;
pub mod release;
pub mod selection;
pub mod validation;

pub use binding::*;
pub use dispatcher::*;
pub use metrics::ControllerMetrics;
pub use reconciler::*;
pub use release::*;
pub use selection::*;
pub use validation::*;
