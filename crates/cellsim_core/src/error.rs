//! Error taxonomy for building kernels and running simulations.
//!
//! Configuration problems are reported before any kernel call and are never
//! wrapped; compilation failures only come out of a kernel build; numerical
//! failures only come out of `run`/`pre` and leave the simulation usable.

use std::fmt;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Compilation(Box<CompilationError>),
    #[error(transparent)]
    Simulation(Box<SimulationError>),
    /// Raised when a progress reporter asks to stop. Safe to retry.
    #[error("Simulation cancelled by user")]
    Cancelled,
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl From<CompilationError> for Error {
    fn from(value: CompilationError) -> Self {
        Error::Compilation(Box::new(value))
    }
}

impl From<SimulationError> for Error {
    fn from(value: SimulationError) -> Self {
        Error::Simulation(Box::new(value))
    }
}

/// Invalid arguments or model configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Simulation time can't be negative (got duration {0})")]
    NegativeDuration(f64),
    #[error("Only one of log_interval and log_times may be set")]
    ConflictingLogSchedule,
    #[error("Log interval must be positive and finite (got {0})")]
    InvalidLogInterval(f64),
    #[error("Invalid log times: {0}")]
    InvalidLogTimes(String),
    #[error("An APD threshold requires an APD variable")]
    ApdThresholdWithoutVariable,
    #[error("An APD variable requires an APD threshold")]
    ApdVariableWithoutThreshold,
    #[error("Variable <{0}> is not a state variable")]
    NotAState(String),
    #[error("Unknown pacing label: {0}")]
    UnknownPacingLabel(String),
    #[error("Variable <{0}> is not a literal constant")]
    NotALiteral(String),
    #[error("Unknown variable: {0}")]
    UnknownVariable(String),
    #[error("Wrong state vector length: expected {expected}, got {got}")]
    StateLength { expected: usize, got: usize },
    #[error("Invalid {what}: {value}")]
    InvalidValue { what: &'static str, value: f64 },
    #[error("Invalid model: {0}")]
    Model(String),
    #[error("Invalid sensitivity specification: {0}")]
    Sensitivity(String),
    #[error("Invalid logging configuration: {0}")]
    Log(String),
    #[error("Template rendering failed: {0}")]
    Template(String),
}

/// Problems with protocol definitions or pacing queries.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Two events cannot start at the same time (t = {time})")]
    Simultaneous { time: f64 },
    #[error("Invalid protocol event: {0}")]
    InvalidEvent(String),
    #[error("Invalid time points: {0}")]
    InvalidTimes(String),
    #[error("Invalid time series protocol: {0}")]
    InvalidTimeSeries(String),
}

/// A failed kernel build, with everything the toolchain said.
#[derive(Debug, thiserror::Error)]
#[error("Unable to compile kernel {module}: {cause}\n\nToolchain output:\n{output}")]
pub struct CompilationError {
    pub module: String,
    pub output: String,
    pub cause: String,
    pub trace: String,
}

impl CompilationError {
    pub fn new(module: impl Into<String>, output: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            output: output.into(),
            cause: cause.into(),
            trace: std::backtrace::Backtrace::capture().to_string(),
        }
    }
}

/// Why the solver could not continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureCode {
    /// The right-hand side produced NaN or infinity.
    NonFiniteDerivative,
    /// The step size fell below the minimum (or below time resolution).
    StepSizeTooSmall,
    /// The local error test failed too many times in a row.
    RepeatedErrorTestFailure,
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureCode::NonFiniteDerivative => "non-finite derivative",
            FailureCode::StepSizeTooSmall => "step size too small",
            FailureCode::RepeatedErrorTestFailure => "repeated error test failure",
        };
        f.write_str(text)
    }
}

/// A numerical failure during stepping, with the diagnostic state.
#[derive(Debug, Clone)]
pub struct SimulationError {
    pub code: FailureCode,
    pub message: String,
    pub time: f64,
    /// Last reached state, by variable name.
    pub state: Vec<(String, f64)>,
    /// Bound input values at the failure point.
    pub inputs: Vec<(String, f64)>,
    /// Derivatives re-evaluated at the failure point, or why that failed.
    pub derivatives: std::result::Result<Vec<(String, f64)>, String>,
}

impl fmt::Display for SimulationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "A numerical error occurred during simulation at t = {}: {} ({})",
            self.time, self.message, self.code
        )?;
        writeln!(f, "Last reached state:")?;
        for (name, value) in &self.state {
            writeln!(f, "  {name} = {value:e}")?;
        }
        writeln!(f, "Inputs for binding:")?;
        for (name, value) in &self.inputs {
            writeln!(f, "  {name} = {value:e}")?;
        }
        match &self.derivatives {
            Ok(derivatives) => {
                writeln!(f, "Derivatives at the last state:")?;
                for (name, value) in derivatives {
                    writeln!(f, "  dot({name}) = {value:e}")?;
                }
            }
            Err(reason) => writeln!(f, "Unable to evaluate derivatives: {reason}")?,
        }
        Ok(())
    }
}

impl std::error::Error for SimulationError {}

/// Kernel misuse or a non-numerical failure inside the kernel.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KernelError {
    #[error("Kernel has not been initialised")]
    NotInitialised,
    #[error("Kernel argument mismatch: {0}")]
    Argument(String),
    #[error("Kernel failure: {0}")]
    Fatal(String),
}

/// Problems reading or writing persisted kernel archives.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Archive I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Archive encoding failed: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("Incompatible archive: {0}")]
    Incompatible(String),
}
