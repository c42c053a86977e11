//! The kernel call interface.
//!
//! A kernel is produced by the [`crate::builder::KernelBuilder`] and owned by
//! exactly one simulation. The driver initialises it for an interval, calls
//! [`Kernel::step`] until the end time is reached, collects the output and
//! cleans it up again. [`KernelSession`] makes the last part unconditional.

mod program;
mod vm;

pub use program::{BoundInput, Dependent, KernelProgram, ProgramIndependent, PROGRAM_FORMAT};
pub use vm::VmKernel;

use crate::error::{FailureCode, KernelError};
use crate::log::DataLog;
use crate::protocol::PacingProtocol;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};

/// Error tolerances and step size bounds of the adaptive solver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverSettings {
    pub abs_tol: f64,
    pub rel_tol: f64,
    /// Smallest step the solver may take; zero for no limit.
    pub min_step: f64,
    /// Largest step the solver may take; zero for no limit.
    pub max_step: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            abs_tol: 1e-6,
            rel_tol: 1e-4,
            min_step: 0.0,
            max_step: 0.0,
        }
    }
}

/// Where a logged column takes its values from. Indices follow model order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    State(usize),
    Derivative(usize),
    Bound(usize),
    Intermediate(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogColumn {
    pub key: String,
    pub source: LogSource,
}

/// When to write log rows.
#[derive(Debug, Clone, PartialEq)]
pub enum LogSchedule {
    /// After every accepted step, plus the starting point.
    Dynamic,
    /// At `t0 + k * interval` for every such point in `[t0, t1)`.
    Periodic(f64),
    /// At the listed (non-decreasing) times that fall in `[t0, t1)`.
    Times(Vec<f64>),
}

/// Threshold crossing detection for one state variable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RootFinding {
    pub state: usize,
    pub threshold: f64,
}

/// Everything a kernel needs to simulate `[t0, t1)`.
#[derive(Debug, Clone)]
pub struct KernelInit {
    pub t0: f64,
    pub t1: f64,
    pub state: Vec<f64>,
    /// One row per independent; empty when the kernel has none.
    pub sensitivity_state: Vec<Vec<f64>>,
    /// Literal values in model order.
    pub literals: Vec<f64>,
    /// Values of the literal independents, in independent order. These
    /// override the matching entries of `literals`.
    pub parameters: Vec<f64>,
    /// One entry per pacing label known to the kernel.
    pub protocols: Vec<Option<PacingProtocol>>,
    pub log: DataLog,
    pub log_columns: Vec<LogColumn>,
    pub log_schedule: LogSchedule,
    /// Collect a dependents-by-independents matrix at every logged point.
    pub sensitivities: bool,
    pub root: Option<RootFinding>,
}

/// Inputs for a one-off derivative evaluation.
#[derive(Debug, Clone, Copy)]
pub struct DerivativeInputs<'a> {
    pub time: f64,
    pub pacing: &'a [f64],
    pub realtime: f64,
    pub evaluations: f64,
    pub literals: &'a [f64],
    pub parameters: &'a [f64],
    pub state: &'a [f64],
}

/// What a finished (or failed) run leaves behind.
#[derive(Debug, Clone, Default)]
pub struct KernelOutput {
    pub log: DataLog,
    pub sensitivities: Vec<Vec<Vec<f64>>>,
    pub crossings: Vec<(f64, i8)>,
}

/// Why a step could not be taken.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepFailure {
    /// The solver gave up; the simulation can be reset and retried.
    #[error("{message}")]
    Numerical { code: FailureCode, message: String },
    /// Anything else, including misuse of the kernel.
    #[error("{0}")]
    Fatal(String),
}

impl From<KernelError> for StepFailure {
    fn from(value: KernelError) -> Self {
        StepFailure::Fatal(value.to_string())
    }
}

/// Step-by-step integrator for one compiled model.
pub trait Kernel: Send {
    /// Unique module name the kernel was built under.
    fn name(&self) -> &str;

    fn init(&mut self, init: KernelInit) -> Result<(), KernelError>;

    /// Takes one accepted step and returns the new time. Returns the end
    /// time unchanged once it has been reached.
    fn step(&mut self) -> Result<f64, StepFailure>;

    /// Releases run resources. Calling it twice is harmless.
    fn clean(&mut self);

    /// Evaluates the state derivatives without touching the kernel state.
    fn evaluate_derivatives(&self, inputs: &DerivativeInputs<'_>) -> Result<Vec<f64>, KernelError>;

    /// Right-hand side evaluations in the last (or current) run.
    fn number_of_evaluations(&self) -> u64;

    /// Accepted steps in the last (or current) run.
    fn number_of_steps(&self) -> u64;

    fn set_tolerance(&mut self, abs_tol: f64, rel_tol: f64);

    /// Zero disables the lower bound.
    fn set_min_step_size(&mut self, dt: f64);

    /// Zero disables the upper bound.
    fn set_max_step_size(&mut self, dt: f64);

    /// Last accepted state.
    fn state(&self) -> &[f64];

    /// Last accepted sensitivity state, one row per independent.
    fn sensitivity_state(&self) -> Vec<Vec<f64>>;

    /// Bound input values at the last accepted point, in model order.
    fn bound_values(&self) -> &[f64];

    /// Moves the log, sensitivities and crossings out of the kernel.
    fn take_output(&mut self) -> KernelOutput;
}

/// Keeps a kernel initialised for the lifetime of the guard and cleans it
/// exactly once when dropped, whatever the exit path.
pub struct KernelSession<'k> {
    kernel: &'k mut dyn Kernel,
}

impl<'k> KernelSession<'k> {
    /// Initialises `kernel`; it is cleaned even if initialisation fails.
    pub fn start(kernel: &'k mut dyn Kernel, init: KernelInit) -> Result<Self, KernelError> {
        let mut session = Self { kernel };
        session.kernel.init(init)?;
        Ok(session)
    }
}

impl<'k> Deref for KernelSession<'k> {
    type Target = dyn Kernel + 'k;

    fn deref(&self) -> &Self::Target {
        &*self.kernel
    }
}

impl<'k> DerefMut for KernelSession<'k> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.kernel
    }
}

impl Drop for KernelSession<'_> {
    fn drop(&mut self) {
        self.kernel.clean();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counting {
        inits: usize,
        cleans: usize,
        fail_init: bool,
    }

    impl Kernel for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        fn init(&mut self, _init: KernelInit) -> Result<(), KernelError> {
            self.inits += 1;
            if self.fail_init {
                Err(KernelError::Argument("bad".to_string()))
            } else {
                Ok(())
            }
        }
        fn step(&mut self) -> Result<f64, StepFailure> {
            Err(StepFailure::Fatal("no stepping".to_string()))
        }
        fn clean(&mut self) {
            self.cleans += 1;
        }
        fn evaluate_derivatives(&self, _inputs: &DerivativeInputs<'_>) -> Result<Vec<f64>, KernelError> {
            Ok(Vec::new())
        }
        fn number_of_evaluations(&self) -> u64 {
            0
        }
        fn number_of_steps(&self) -> u64 {
            0
        }
        fn set_tolerance(&mut self, _abs_tol: f64, _rel_tol: f64) {}
        fn set_min_step_size(&mut self, _dt: f64) {}
        fn set_max_step_size(&mut self, _dt: f64) {}
        fn state(&self) -> &[f64] {
            &[]
        }
        fn sensitivity_state(&self) -> Vec<Vec<f64>> {
            Vec::new()
        }
        fn bound_values(&self) -> &[f64] {
            &[]
        }
        fn take_output(&mut self) -> KernelOutput {
            KernelOutput::default()
        }
    }

    fn init() -> KernelInit {
        KernelInit {
            t0: 0.0,
            t1: 1.0,
            state: Vec::new(),
            sensitivity_state: Vec::new(),
            literals: Vec::new(),
            parameters: Vec::new(),
            protocols: Vec::new(),
            log: DataLog::new("time"),
            log_columns: Vec::new(),
            log_schedule: LogSchedule::Dynamic,
            sensitivities: false,
            root: None,
        }
    }

    #[test]
    fn session_cleans_once_on_every_exit_path() {
        let mut kernel = Counting::default();
        {
            let mut session = KernelSession::start(&mut kernel, init()).expect("init");
            assert!(session.step().is_err());
        }
        assert_eq!((kernel.inits, kernel.cleans), (1, 1));

        kernel.fail_init = true;
        assert!(KernelSession::start(&mut kernel, init()).is_err());
        assert_eq!((kernel.inits, kernel.cleans), (2, 2));
    }
}
