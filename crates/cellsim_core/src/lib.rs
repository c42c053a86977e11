pub mod autodiff;
pub mod builder;
pub mod equation_engine;
pub mod error;
pub mod kernel;
pub mod log;
pub mod model;
pub mod progress;
pub mod protocol;
pub mod simulation;
pub mod solvers;
pub mod source;
/// The `cellsim_core` crate runs ODE-based cell simulations under external
/// pacing protocols.
///
/// Key components:
/// - **Protocols**: event schedules and sampled time series mapping time to a pacing value.
/// - **Builder**: renders kernel sources and builds them into kernels under process-unique names.
/// - **Kernel**: the step-by-step integrator interface and its bytecode implementation
///   (adaptive Dormand-Prince with forward sensitivities and root finding).
/// - **Simulation**: the stateful driver with logging, pre-pacing, cancellation and failure diagnostics.
pub mod traits;

pub use error::{Error, Result};
pub use log::{ApdLog, DataLog, LogFlags, LogSpec};
pub use model::{Binding, Model, SensitivitySpec};
pub use protocol::{blocktrain, steptrain, PacingProtocol, Protocol, ProtocolEvent, TimeSeriesProtocol};
pub use simulation::{BoundInputs, RunOptions, RunOutput, Simulation, SimulationBuilder};
