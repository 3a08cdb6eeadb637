//! Job pipeline for the monitoring engine.
//!
//! - `CycleRunner`: one fetch/detect/classify/dispatch cycle for a source
//! - `Scheduler`: cadence evaluation, single-in-flight claims, worker limit
//! - `Engine`: wiring from configuration, hot reload and shutdown

pub mod circuit_breaker;
pub mod cycle;
pub mod diff;
pub mod engine;
pub mod scheduler;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CycleVerdict};
pub use cycle::CycleRunner;
pub use diff::{DiffCalculator, LineDiff};
pub use engine::{Engine, EngineBuilder};
pub use scheduler::{JobHandle, Scheduler, SourceState};
