//! Slide extraction from recorded talks: strided frame sampling with
//! near-duplicate suppression against recently accepted slides and
//! trained-match suppression against known non-slide imagery.

pub mod filter;
pub mod sieve;
pub mod storage;
pub mod window;

pub use sieve::{
    CancellationFlag, Controller, ProgressEvent, ProgressSink, RunCounters, RunError, RunPhase,
    RunReport, RunStatus,
};
