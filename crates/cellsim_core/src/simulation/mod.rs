//! The simulation driver.
//!
//! A [`Simulation`] owns one kernel, a model snapshot and the mutable state of
//! a simulated cell: time, current and default state, and (optionally)
//! current and default sensitivities. `run` and `pre` drive the kernel over
//! an interval; everything else validates and stores configuration.
//!
//! Arguments are checked before the kernel is touched. Numerical failures
//! leave the simulation usable: the state is not updated, the last reached
//! state and inputs are kept for inspection, and a `reset` followed by a
//! corrected run works as usual.

mod snapshot;

pub use snapshot::SimulationSnapshot;

use crate::builder::{ArchiveMetadata, BuildOptions, KernelArchive, KernelBuilder};
use crate::error::{ArchiveError, ConfigError, Error, FailureCode, KernelError, Result, SimulationError};
use crate::kernel::{
    DerivativeInputs, Kernel, KernelInit, KernelOutput, KernelSession, LogColumn, LogSchedule,
    LogSource, RootFinding, SolverSettings, StepFailure,
};
use crate::log::{derivative_key, parse_derivative_key, ApdLog, DataLog, LogFlags, LogSpec};
use crate::model::{Binding, Model, SensitivitySpec, VariableKind};
use crate::progress::ProgressReporter;
use crate::protocol::PacingProtocol;
use crate::source::write_kernel_source;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

/// Logging and root finding for one call to [`Simulation::run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub log: LogSpec,
    /// Log at fixed intervals from the start of the run instead of after
    /// every step.
    pub log_interval: Option<f64>,
    /// Log at these (non-decreasing) times; those outside the run are skipped.
    pub log_times: Option<Vec<f64>>,
    /// State variable whose threshold crossings are recorded.
    pub apd_variable: Option<String>,
    pub apd_threshold: Option<f64>,
    /// Passed to the progress reporter.
    pub message: Option<String>,
}

/// What a run produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutput {
    pub log: DataLog,
    /// One dependents-by-independents matrix per logged point; empty without
    /// sensitivities.
    pub sensitivities: Vec<Vec<Vec<f64>>>,
    /// Present when an APD variable was given.
    pub apds: Option<ApdLog>,
}

/// Values for the bound inputs of a one-off derivative evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundInputs {
    pub time: f64,
    /// Pacing values by label; missing labels are zero.
    pub pacing: BTreeMap<String, f64>,
    pub realtime: f64,
    pub evaluations: f64,
}

#[derive(Debug, Clone)]
struct BuildRecord {
    source: String,
    artifact: Vec<u8>,
    options: BuildOptions,
}

#[derive(Debug, Clone)]
struct CrashSnapshot {
    state: Vec<f64>,
    inputs: Vec<(String, f64)>,
}

/// Everything a validated run needs besides the interval.
struct RunPlan {
    log: DataLog,
    columns: Vec<LogColumn>,
    schedule: LogSchedule,
    root: Option<RootFinding>,
    collect_sensitivities: bool,
}

enum Stopped {
    Init(KernelError),
    Cancelled,
    Failed {
        failure: StepFailure,
        time: f64,
        state: Vec<f64>,
        bound: Vec<f64>,
    },
}

struct Finished {
    output: KernelOutput,
    state: Vec<f64>,
    sensitivity_state: Vec<Vec<f64>>,
}

/// Configures and builds a [`Simulation`].
pub struct SimulationBuilder {
    model: Model,
    protocols: BTreeMap<String, Option<PacingProtocol>>,
    sensitivities: Option<SensitivitySpec>,
    kernel_builder: Option<KernelBuilder>,
    kernel: Option<Box<dyn Kernel>>,
}

impl SimulationBuilder {
    pub fn new(model: Model) -> Self {
        Self {
            model,
            protocols: BTreeMap::new(),
            sensitivities: None,
            kernel_builder: None,
            kernel: None,
        }
    }

    /// Binds a protocol to a pacing label.
    pub fn protocol(mut self, label: impl Into<String>, protocol: impl Into<PacingProtocol>) -> Self {
        self.protocols.insert(label.into(), Some(protocol.into()));
        self
    }

    /// Declares a pacing label without a protocol, so one can be set later.
    pub fn pacing_label(mut self, label: impl Into<String>) -> Self {
        self.protocols.entry(label.into()).or_insert(None);
        self
    }

    pub fn sensitivities(mut self, spec: SensitivitySpec) -> Self {
        self.sensitivities = Some(spec);
        self
    }

    /// Uses `builder` instead of the default in-process bytecode builder.
    pub fn kernel_builder(mut self, builder: KernelBuilder) -> Self {
        self.kernel_builder = Some(builder);
        self
    }

    /// Uses an existing kernel instead of building one. The kernel must have
    /// been built for the same model, labels (sorted) and sensitivities.
    pub fn kernel(mut self, kernel: Box<dyn Kernel>) -> Self {
        self.kernel = Some(kernel);
        self
    }

    pub fn build(self) -> Result<Simulation> {
        let SimulationBuilder {
            model,
            mut protocols,
            sensitivities,
            kernel_builder,
            kernel,
        } = self;

        model.validate()?;
        if model.time_variable().is_none() {
            return Err(ConfigError::Model("No variable is bound to time".to_string()).into());
        }
        if let Some(spec) = &sensitivities {
            spec.validate(&model)?;
        }
        for label in model.pace_labels() {
            protocols.entry(label).or_insert(None);
        }
        let labels: Vec<String> = protocols.keys().cloned().collect();

        let (kernel, build) = match kernel {
            Some(kernel) => (kernel, None),
            None => {
                let builder = kernel_builder.unwrap_or_default();
                let template = write_kernel_source(&model, &labels, sensitivities.as_ref());
                let built = builder.compile(model.name(), &template, &BTreeMap::new())?;
                let record = BuildRecord {
                    source: built.source,
                    artifact: built.artifact,
                    options: builder.options().clone(),
                };
                (Box::new(built.kernel) as Box<dyn Kernel>, Some(record))
            }
        };

        Ok(Simulation::assemble(model, protocols, sensitivities, kernel, build))
    }
}

/// A stateful simulation of one model, backed by its own kernel.
pub struct Simulation {
    model: Model,
    sensitivities: Option<SensitivitySpec>,
    labels: Vec<String>,
    protocols: Vec<Option<PacingProtocol>>,
    kernel: Box<dyn Kernel>,
    build: Option<BuildRecord>,
    settings: SolverSettings,
    time: f64,
    state: Vec<f64>,
    default_state: Vec<f64>,
    sensitivity_state: Vec<Vec<f64>>,
    default_sensitivity_state: Vec<Vec<f64>>,
    crash: Option<CrashSnapshot>,
    evaluations: u64,
    steps: u64,
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("model", &self.model.name())
            .field("kernel", &self.kernel.name())
            .field("labels", &self.labels)
            .field("time", &self.time)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Simulation {
    /// Builds a simulation with the default kernel builder.
    pub fn new(model: Model) -> Result<Self> {
        SimulationBuilder::new(model).build()
    }

    pub fn builder(model: Model) -> SimulationBuilder {
        SimulationBuilder::new(model)
    }

    fn assemble(
        model: Model,
        protocols: BTreeMap<String, Option<PacingProtocol>>,
        sensitivities: Option<SensitivitySpec>,
        mut kernel: Box<dyn Kernel>,
        build: Option<BuildRecord>,
    ) -> Self {
        let settings = SolverSettings::default();
        kernel.set_tolerance(settings.abs_tol, settings.rel_tol);
        kernel.set_min_step_size(settings.min_step);
        kernel.set_max_step_size(settings.max_step);

        let state = model.initial_state();
        let sensitivity_state = sensitivities
            .as_ref()
            .map(|spec| spec.initial_sensitivities(&model))
            .unwrap_or_default();
        let (labels, protocols) = protocols.into_iter().unzip();
        info!(model = %model.name(), kernel = %kernel.name(), "simulation created");
        Self {
            default_state: state.clone(),
            default_sensitivity_state: sensitivity_state.clone(),
            state,
            sensitivity_state,
            model,
            sensitivities,
            labels,
            protocols,
            kernel,
            build,
            settings,
            time: 0.0,
            crash: None,
            evaluations: 0,
            steps: 0,
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn sensitivity_spec(&self) -> Option<&SensitivitySpec> {
        self.sensitivities.as_ref()
    }

    /// Name of the kernel module backing this simulation.
    pub fn kernel_name(&self) -> &str {
        self.kernel.name()
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn state(&self) -> &[f64] {
        &self.state
    }

    pub fn default_state(&self) -> &[f64] {
        &self.default_state
    }

    /// One row per independent, empty without sensitivities.
    pub fn sensitivity_state(&self) -> &[Vec<f64>] {
        &self.sensitivity_state
    }

    pub fn default_sensitivity_state(&self) -> &[Vec<f64>] {
        &self.default_sensitivity_state
    }

    pub fn settings(&self) -> SolverSettings {
        self.settings
    }

    /// Pacing labels, sorted.
    pub fn pace_labels(&self) -> &[String] {
        &self.labels
    }

    /// The protocol bound to `label`, if any.
    pub fn protocol(&self, label: &str) -> Option<&PacingProtocol> {
        let index = self.labels.iter().position(|l| l == label)?;
        self.protocols[index].as_ref()
    }

    /// State at the last accepted point of the run that failed, if the last
    /// run failed.
    pub fn crash_state(&self) -> Option<&[f64]> {
        self.crash.as_ref().map(|crash| crash.state.as_slice())
    }

    /// Bound input values at the point [`Simulation::crash_state`] refers to.
    pub fn crash_inputs(&self) -> Option<&[(String, f64)]> {
        self.crash.as_ref().map(|crash| crash.inputs.as_slice())
    }

    pub fn last_number_of_evaluations(&self) -> u64 {
        self.evaluations
    }

    pub fn last_number_of_steps(&self) -> u64 {
        self.steps
    }

    pub fn set_time(&mut self, time: f64) -> Result<()> {
        check_non_negative("time", time)?;
        self.time = time;
        Ok(())
    }

    pub fn set_state(&mut self, state: &[f64]) -> Result<()> {
        self.check_state(state)?;
        self.state = state.to_vec();
        Ok(())
    }

    pub fn set_default_state(&mut self, state: &[f64]) -> Result<()> {
        self.check_state(state)?;
        self.default_state = state.to_vec();
        Ok(())
    }

    fn check_state(&self, state: &[f64]) -> Result<()> {
        let expected = self.model.count_states();
        if state.len() != expected {
            return Err(ConfigError::StateLength {
                expected,
                got: state.len(),
            }
            .into());
        }
        for &value in state {
            check_finite("state value", value)?;
        }
        Ok(())
    }

    pub fn set_tolerance(&mut self, abs_tol: f64, rel_tol: f64) -> Result<()> {
        check_positive("absolute tolerance", abs_tol)?;
        check_positive("relative tolerance", rel_tol)?;
        self.settings.abs_tol = abs_tol;
        self.settings.rel_tol = rel_tol;
        self.kernel.set_tolerance(abs_tol, rel_tol);
        Ok(())
    }

    /// Zero removes the bound.
    pub fn set_min_step_size(&mut self, dt: f64) -> Result<()> {
        check_non_negative("minimum step size", dt)?;
        self.settings.min_step = dt;
        self.kernel.set_min_step_size(dt);
        Ok(())
    }

    /// Zero removes the bound.
    pub fn set_max_step_size(&mut self, dt: f64) -> Result<()> {
        check_non_negative("maximum step size", dt)?;
        self.settings.max_step = dt;
        self.kernel.set_max_step_size(dt);
        Ok(())
    }

    fn apply_settings(&mut self, settings: SolverSettings) -> Result<()> {
        self.set_tolerance(settings.abs_tol, settings.rel_tol)?;
        self.set_min_step_size(settings.min_step)?;
        self.set_max_step_size(settings.max_step)
    }

    /// Changes a literal constant. The kernel picks up the new value at the
    /// start of the next run.
    pub fn set_constant(&mut self, name: &str, value: f64) -> Result<()> {
        self.model.set_literal(name, value)?;
        debug!(name, value, "constant changed");
        Ok(())
    }

    /// Replaces the protocol of `label`; `None` unbinds it (pacing value 0).
    pub fn set_protocol(&mut self, label: &str, protocol: Option<PacingProtocol>) -> Result<()> {
        let index = self
            .labels
            .iter()
            .position(|l| l == label)
            .ok_or_else(|| ConfigError::UnknownPacingLabel(label.to_string()))?;
        self.protocols[index] = protocol;
        Ok(())
    }

    /// Restores the default state and sensitivities and sets time to zero.
    pub fn reset(&mut self) {
        self.time = 0.0;
        self.state.clone_from(&self.default_state);
        self.sensitivity_state.clone_from(&self.default_sensitivity_state);
    }

    /// Evaluates the derivatives at `state` (the current state if `None`)
    /// without touching the simulation.
    pub fn evaluate_derivatives(&self, state: Option<&[f64]>, inputs: &BoundInputs) -> Result<Vec<f64>> {
        let state = state.unwrap_or(&self.state);
        self.check_state(state)?;
        if let Some(label) = inputs.pacing.keys().find(|l| !self.labels.contains(l)) {
            return Err(ConfigError::UnknownPacingLabel(label.clone()).into());
        }
        let pacing: Vec<f64> = self
            .labels
            .iter()
            .map(|label| inputs.pacing.get(label).copied().unwrap_or(0.0))
            .collect();
        let (literals, parameters) = self.constants();
        let derivatives = self.kernel.evaluate_derivatives(&DerivativeInputs {
            time: inputs.time,
            pacing: &pacing,
            realtime: inputs.realtime,
            evaluations: inputs.evaluations,
            literals: &literals,
            parameters: &parameters,
            state,
        })?;
        Ok(derivatives)
    }

    /// Literal values in model order, and the values of the literal
    /// independents.
    fn constants(&self) -> (Vec<f64>, Vec<f64>) {
        let literals: Vec<f64> = self.model.literals().iter().map(|l| l.value).collect();
        let parameters: Vec<f64> = self
            .sensitivities
            .as_ref()
            .map(|spec| {
                spec.parameters()
                    .into_iter()
                    .filter_map(|name| self.model.literal_index(name).map(|i| literals[i]))
                    .collect()
            })
            .unwrap_or_default();
        (literals, parameters)
    }

    /// Simulates `[time, time + duration)` and returns what was logged.
    ///
    /// When `time + duration == time` in floating point the kernel is not
    /// called at all and nothing changes.
    pub fn run(
        &mut self,
        duration: f64,
        options: RunOptions,
        progress: Option<&mut dyn ProgressReporter>,
    ) -> Result<RunOutput> {
        check_duration(duration)?;
        let apd = match (options.apd_variable, options.apd_threshold) {
            (None, None) => None,
            (None, Some(_)) => return Err(ConfigError::ApdThresholdWithoutVariable.into()),
            (Some(_), None) => return Err(ConfigError::ApdVariableWithoutThreshold.into()),
            (Some(variable), Some(threshold)) => Some((variable, threshold)),
        };
        let plan = self.plan(options.log, options.log_interval, options.log_times, apd)?;
        let with_apds = plan.root.is_some();
        self.crash = None;

        let t1 = self.time + duration;
        if t1 == self.time {
            debug!(time = self.time, duration, "skipping degenerate run");
            return Ok(RunOutput {
                log: plan.log,
                sensitivities: Vec::new(),
                apds: with_apds.then(ApdLog::default),
            });
        }

        let message = options.message.as_deref().unwrap_or("Running simulation");
        let finished = self.simulate(t1, plan, progress, message)?;
        self.state = finished.state;
        self.sensitivity_state = finished.sensitivity_state;
        self.time = t1;
        let output = finished.output;
        Ok(RunOutput {
            apds: with_apds.then(|| ApdLog::from_crossings(&output.crossings)),
            log: output.log,
            sensitivities: output.sensitivities,
        })
    }

    /// Simulates without logging and makes the final state the new default.
    ///
    /// Pre-pacing redefines time zero: the time is left unchanged and the
    /// sensitivities (current and default) restart from their values at zero.
    pub fn pre(&mut self, duration: f64, progress: Option<&mut dyn ProgressReporter>) -> Result<()> {
        check_duration(duration)?;
        let mut plan = self.plan(LogSpec::Flags(LogFlags::NONE), None, None, None)?;
        plan.collect_sensitivities = false;
        self.crash = None;

        let t1 = self.time + duration;
        if t1 == self.time {
            debug!(time = self.time, duration, "skipping degenerate pre-pacing");
            return Ok(());
        }

        let finished = self.simulate(t1, plan, progress, "Pre-pacing simulation")?;
        self.state = finished.state;
        self.default_state.clone_from(&self.state);
        if let Some(spec) = &self.sensitivities {
            self.sensitivity_state = spec.initial_sensitivities(&self.model);
            self.default_sensitivity_state.clone_from(&self.sensitivity_state);
        }
        Ok(())
    }

    /// Validates logging and root finding options against the model.
    fn plan(
        &self,
        log: LogSpec,
        log_interval: Option<f64>,
        log_times: Option<Vec<f64>>,
        apd: Option<(String, f64)>,
    ) -> Result<RunPlan> {
        let schedule = match (log_interval, log_times) {
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingLogSchedule.into()),
            (Some(interval), None) => {
                if !(interval.is_finite() && interval > 0.0) {
                    return Err(ConfigError::InvalidLogInterval(interval).into());
                }
                LogSchedule::Periodic(interval)
            }
            (None, Some(times)) => {
                if times.iter().any(|t| !t.is_finite()) {
                    return Err(ConfigError::InvalidLogTimes("times must be finite".to_string()).into());
                }
                if times.windows(2).any(|w| w[1] < w[0]) {
                    return Err(
                        ConfigError::InvalidLogTimes("times must be non-decreasing".to_string()).into(),
                    );
                }
                LogSchedule::Times(times)
            }
            (None, None) => LogSchedule::Dynamic,
        };

        let root = match apd {
            None => None,
            Some((variable, threshold)) => {
                let state = self
                    .model
                    .state_index(&variable)
                    .ok_or(ConfigError::NotAState(variable))?;
                check_finite("APD threshold", threshold)?;
                Some(RootFinding { state, threshold })
            }
        };

        let (log, columns) = self.log_columns(log)?;
        Ok(RunPlan {
            log,
            columns,
            schedule,
            root,
            collect_sensitivities: self.sensitivities.is_some(),
        })
    }

    fn log_columns(&self, spec: LogSpec) -> Result<(DataLog, Vec<LogColumn>)> {
        let model = &self.model;
        let time_index = model
            .bound()
            .iter()
            .position(|b| b.binding == Binding::Time)
            .ok_or_else(|| ConfigError::Model("No variable is bound to time".to_string()))?;
        let time_key = model.bound()[time_index].name.clone();
        let column = |key: &str, source| LogColumn {
            key: key.to_string(),
            source,
        };

        let (log, keys) = match spec {
            LogSpec::Flags(flags) => {
                let mut columns = Vec::new();
                if flags.is_empty() {
                    return Ok((DataLog::new(time_key), columns));
                }
                columns.push(column(&time_key, LogSource::Bound(time_index)));
                if flags.contains(LogFlags::STATE) {
                    for (i, state) in model.states().iter().enumerate() {
                        columns.push(column(&state.name, LogSource::State(i)));
                    }
                }
                if flags.contains(LogFlags::BOUND) {
                    for (i, bound) in model.bound().iter().enumerate() {
                        if i != time_index {
                            columns.push(column(&bound.name, LogSource::Bound(i)));
                        }
                    }
                }
                if flags.contains(LogFlags::INTER) {
                    for (i, eq) in model.intermediates().iter().enumerate() {
                        columns.push(column(&eq.name, LogSource::Intermediate(i)));
                    }
                }
                if flags.contains(LogFlags::DERIV) {
                    for (i, state) in model.states().iter().enumerate() {
                        columns.push(column(&derivative_key(&state.name), LogSource::Derivative(i)));
                    }
                }
                return Ok((DataLog::new(time_key), columns));
            }
            LogSpec::Variables(names) => {
                let mut keys: Vec<String> = Vec::with_capacity(names.len() + 1);
                if !names.contains(&time_key) {
                    keys.push(time_key.clone());
                }
                keys.extend(names);
                (DataLog::new(time_key.as_str()), keys)
            }
            LogSpec::Continue(log) => {
                if log.time_key() != time_key {
                    return Err(ConfigError::Log(format!(
                        "log is keyed by <{}> but time is <{time_key}>",
                        log.time_key()
                    ))
                    .into());
                }
                if !log.contains_key(&time_key) {
                    return Err(ConfigError::Log(format!("log has no <{time_key}> column")).into());
                }
                let keys = log.keys().map(str::to_string).collect();
                (log, keys)
            }
        };

        let mut seen = BTreeSet::new();
        let mut columns = Vec::with_capacity(keys.len());
        for key in keys {
            if !seen.insert(key.clone()) {
                return Err(ConfigError::Log(format!("<{key}> is logged twice")).into());
            }
            let source = self.resolve_log_key(&key)?;
            columns.push(LogColumn { key, source });
        }
        Ok((log, columns))
    }

    fn resolve_log_key(&self, key: &str) -> Result<LogSource> {
        let model = &self.model;
        if let Some(state) = parse_derivative_key(key) {
            return model
                .state_index(state)
                .map(LogSource::Derivative)
                .ok_or_else(|| ConfigError::NotAState(state.to_string()).into());
        }
        let source = match model.kind_of(key) {
            Some(VariableKind::State) => model.state_index(key).map(LogSource::State),
            Some(VariableKind::Bound) => model.bound().iter().position(|b| b.name == key).map(LogSource::Bound),
            Some(VariableKind::Intermediate) => model
                .intermediates()
                .iter()
                .position(|e| e.name == key)
                .map(LogSource::Intermediate),
            Some(VariableKind::Literal | VariableKind::Derived) => {
                return Err(ConfigError::Log(format!("constant <{key}> cannot be logged")).into())
            }
            None => None,
        };
        source.ok_or_else(|| ConfigError::UnknownVariable(key.to_string()).into())
    }

    /// Drives the kernel from the current time to `t1`.
    fn simulate(
        &mut self,
        t1: f64,
        plan: RunPlan,
        mut progress: Option<&mut dyn ProgressReporter>,
        message: &str,
    ) -> Result<Finished> {
        let (literals, parameters) = self.constants();
        let init = KernelInit {
            t0: self.time,
            t1,
            state: self.state.clone(),
            sensitivity_state: self.sensitivity_state.clone(),
            literals,
            parameters,
            protocols: self.protocols.clone(),
            log: plan.log,
            log_columns: plan.columns,
            log_schedule: plan.schedule,
            sensitivities: plan.collect_sensitivities,
            root: plan.root,
        };

        info!(kernel = %self.kernel.name(), t0 = self.time, t1, "running simulation");
        if let Some(reporter) = progress.as_deref_mut() {
            reporter.enter(Some(message));
        }
        let outcome = drive(self.kernel.as_mut(), init, progress.as_deref_mut());
        if let Some(reporter) = progress {
            reporter.exit();
        }
        self.evaluations = self.kernel.number_of_evaluations();
        self.steps = self.kernel.number_of_steps();

        match outcome {
            Ok(finished) => {
                debug!(steps = self.steps, evaluations = self.evaluations, "simulation finished");
                Ok(finished)
            }
            Err(Stopped::Init(err)) => Err(err.into()),
            Err(Stopped::Cancelled) => {
                info!(t0 = self.time, t1, "simulation cancelled");
                Err(Error::Cancelled)
            }
            Err(Stopped::Failed {
                failure: StepFailure::Fatal(message),
                ..
            }) => Err(KernelError::Fatal(message).into()),
            Err(Stopped::Failed {
                failure: StepFailure::Numerical { code, message },
                time,
                state,
                bound,
            }) => {
                let error = self.diagnose(code, message, time, state, bound);
                warn!(time = error.time, code = %error.code, "numerical failure");
                Err(error.into())
            }
        }
    }

    /// Records the crash snapshot and gathers everything known about the
    /// failure point.
    fn diagnose(
        &mut self,
        code: FailureCode,
        message: String,
        time: f64,
        state: Vec<f64>,
        bound: Vec<f64>,
    ) -> SimulationError {
        let inputs: Vec<(String, f64)> = self
            .model
            .bound()
            .iter()
            .map(|b| b.name.clone())
            .zip(bound.iter().copied())
            .collect();
        let input_value = |binding: Binding| {
            self.model
                .bound()
                .iter()
                .position(|b| b.binding == binding)
                .and_then(|i| bound.get(i).copied())
                .unwrap_or(0.0)
        };
        let pacing = self
            .labels
            .iter()
            .zip(&self.protocols)
            .map(|(label, protocol)| {
                let value = protocol
                    .as_ref()
                    .and_then(|p| p.value_at_times(&[time]).ok())
                    .and_then(|values| values.first().copied())
                    .unwrap_or(0.0);
                (label.clone(), value)
            })
            .collect();
        let request = BoundInputs {
            time,
            pacing,
            realtime: input_value(Binding::Realtime),
            evaluations: input_value(Binding::Evaluations),
        };
        let names = self.model.state_names();
        let derivatives: std::result::Result<Vec<(String, f64)>, String> = self
            .evaluate_derivatives(Some(&state), &request)
            .map(|values| names.iter().cloned().zip(values).collect())
            .map_err(|err| err.to_string());

        self.crash = Some(CrashSnapshot {
            state: state.clone(),
            inputs: inputs.clone(),
        });
        SimulationError {
            code,
            message,
            time,
            state: names.into_iter().zip(state).collect(),
            inputs,
            derivatives,
        }
    }

    /// Writes the kernel and the static configuration to an archive.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let build = self.build.as_ref().ok_or_else(|| {
            ArchiveError::Incompatible(format!(
                "kernel {} was supplied pre-built and has no artifact",
                self.kernel.name()
            ))
        })?;
        let metadata = ArchiveMetadata {
            name: self.kernel.name().to_string(),
            model: self.model.clone(),
            protocols: self.protocol_map(),
            sensitivities: self.sensitivities.clone(),
            options: build.options.clone(),
        };
        KernelBuilder::persist(path, metadata, &build.source, &build.artifact)?;
        Ok(())
    }

    /// Loads a simulation from an archive written by [`Simulation::persist`].
    /// Time and state start from the model defaults.
    pub fn from_archive(path: &Path) -> Result<Self> {
        let (archive, kernel) = KernelBuilder::load_archive(path)?;
        let KernelArchive {
            metadata, source, artifact, ..
        } = archive;
        if let Some(spec) = &metadata.sensitivities {
            spec.validate(&metadata.model)?;
        }
        let build = BuildRecord {
            source,
            artifact,
            options: metadata.options,
        };
        Ok(Self::assemble(
            metadata.model,
            metadata.protocols,
            metadata.sensitivities,
            Box::new(kernel),
            Some(build),
        ))
    }

    fn protocol_map(&self) -> BTreeMap<String, Option<PacingProtocol>> {
        self.labels.iter().cloned().zip(self.protocols.iter().cloned()).collect()
    }
}

/// Initialises the kernel and steps it to the end time. The kernel is
/// cleaned when this returns, on every path.
fn drive(
    kernel: &mut dyn Kernel,
    init: KernelInit,
    mut progress: Option<&mut (dyn ProgressReporter + '_)>,
) -> std::result::Result<Finished, Stopped> {
    let (t0, t1) = (init.t0, init.t1);
    let mut session = KernelSession::start(kernel, init).map_err(Stopped::Init)?;
    let mut t = t0;
    while t < t1 {
        t = match session.step() {
            Ok(time) => time,
            Err(failure) => {
                return Err(Stopped::Failed {
                    failure,
                    time: t,
                    state: session.state().to_vec(),
                    bound: session.bound_values().to_vec(),
                })
            }
        };
        if t < t1 {
            if let Some(reporter) = progress.as_deref_mut() {
                if !reporter.update((t - t0) / (t1 - t0)) {
                    return Err(Stopped::Cancelled);
                }
            }
        }
    }
    Ok(Finished {
        output: session.take_output(),
        state: session.state().to_vec(),
        sensitivity_state: session.sensitivity_state(),
    })
}

fn check_duration(duration: f64) -> std::result::Result<(), ConfigError> {
    if duration.is_nan() || duration < 0.0 {
        return Err(ConfigError::NegativeDuration(duration));
    }
    check_finite("duration", duration)
}

fn check_finite(what: &'static str, value: f64) -> std::result::Result<(), ConfigError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue { what, value })
    }
}

fn check_positive(what: &'static str, value: f64) -> std::result::Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue { what, value })
    }
}

fn check_non_negative(what: &'static str, value: f64) -> std::result::Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue { what, value })
    }
}
