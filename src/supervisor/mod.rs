//! Child-process supervision: lifecycle, liveness probes and output capture.

pub mod handle;
pub mod log_sink;
pub mod probe;
pub mod process;
pub mod status;

pub use handle::SupervisorHandle;
pub use log_sink::{FileLogSink, LogSink, OutputStream, TracingLogSink};
pub use probe::{FnProbe, HttpProbe, LivenessProbe, ProbeError, TcpProbe};
pub use process::{
    ProcessSpec, ProcessSupervisor, StatusObserver, SupervisorError, DEFAULT_STOP_TIMEOUT,
};
pub use status::{Health, ServiceStatus};

#[cfg(test)]
#[path = "tests/status_tests.rs"]
mod status_tests;
