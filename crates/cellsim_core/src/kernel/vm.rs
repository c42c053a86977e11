use super::program::{BoundInput, CompiledEquation, Dependent, KernelProgram, ProgramIndependent};
use super::{
    DerivativeInputs, Kernel, KernelInit, KernelOutput, LogSchedule, LogSource, RootFinding,
    SolverSettings, StepFailure,
};
use crate::autodiff::Dual;
use crate::equation_engine::VM;
use crate::error::{FailureCode, KernelError};
use crate::log::DataLog;
use crate::protocol::Pacer;
use crate::solvers::{hermite, hermite_component, initial_step, DormandPrince, Tolerance};
use crate::traits::{DynamicalSystem, Scalar};
use std::time::Instant;
use tracing::{debug, trace};

const SAFETY: f64 = 0.9;
const MIN_SHRINK: f64 = 0.2;
const MAX_GROWTH: f64 = 5.0;
const MAX_ERROR_TEST_FAILURES: u32 = 50;
const ROOT_BISECTIONS: usize = 60;

/// Evaluates the intermediates and then the state derivatives of `program`.
fn run_equations<T: Scalar>(program: &KernelProgram, frame: &mut [T], stack: &mut Vec<T>, out: &mut [T]) {
    for eq in &program.intermediates {
        let value = VM::execute(&eq.code, frame, stack);
        frame[eq.slot] = value;
    }
    for (target, code) in out.iter_mut().zip(&program.rhs) {
        *target = VM::execute(code, frame, stack);
    }
}

fn run_derived<T: Scalar>(derived: &[CompiledEquation], frame: &mut [T], stack: &mut Vec<T>) {
    for eq in derived {
        let value = VM::execute(&eq.code, frame, stack);
        frame[eq.slot] = value;
    }
}

/// Evaluation frames and everything bound inputs are computed from.
///
/// With independents, one dual-number frame per independent is evaluated
/// and the plain frame is unused: the real parts give the derivatives, the
/// tangents give the sensitivity derivatives.
struct Workspace {
    frame: Vec<f64>,
    duals: Vec<Vec<Dual>>,
    stack: Vec<f64>,
    dual_stack: Vec<Dual>,
    dual_out: Vec<Dual>,
    pacers: Vec<Pacer>,
    bound: Vec<f64>,
    evaluations: u64,
    started: Instant,
}

impl Workspace {
    fn new(program: &KernelProgram, sensitivities: bool) -> Self {
        let len = program.layout.len;
        let m = if sensitivities {
            program.independents.len()
        } else {
            0
        };
        Self {
            frame: vec![0.0; len],
            duals: vec![vec![Dual::new(0.0, 0.0); len]; m],
            stack: Vec::new(),
            dual_stack: Vec::new(),
            dual_out: vec![Dual::new(0.0, 0.0); program.state_count()],
            pacers: vec![Pacer::Idle; program.labels.len()],
            bound: vec![0.0; program.bound.len()],
            evaluations: 0,
            started: Instant::now(),
        }
    }

    /// Writes the literal slots, then computes the derived constants. Each
    /// dual frame gets a unit tangent on its own literal independent.
    fn load_constants(
        &mut self,
        program: &KernelProgram,
        literals: &[f64],
        parameters: &[f64],
    ) -> Result<(), KernelError> {
        let count = program.model.literals().len();
        if literals.len() != count {
            return Err(KernelError::Argument(format!(
                "expected {count} literal values, got {}",
                literals.len()
            )));
        }
        let params = program.parameter_literals();
        if parameters.len() != params.len() {
            return Err(KernelError::Argument(format!(
                "expected {} parameter values, got {}",
                params.len(),
                parameters.len()
            )));
        }
        let base = program.layout.literals;
        self.frame[base..base + count].copy_from_slice(literals);
        for (&index, &value) in params.iter().zip(parameters) {
            self.frame[base + index] = value;
        }
        run_derived(&program.derived, &mut self.frame, &mut self.stack);

        for (frame, independent) in self.duals.iter_mut().zip(&program.independents) {
            for i in base..base + count {
                frame[i] = Dual::new(self.frame[i], 0.0);
            }
            if let ProgramIndependent::Literal(index) = *independent {
                frame[base + index].eps = 1.0;
            }
            run_derived(&program.derived, frame, &mut self.dual_stack);
        }
        Ok(())
    }

    fn set_bound(&mut self, program: &KernelProgram, t: f64) {
        let realtime = self.started.elapsed().as_secs_f64();
        for (value, input) in self.bound.iter_mut().zip(&program.bound) {
            *value = match *input {
                BoundInput::Time => t,
                BoundInput::Pace(Some(label)) => self.pacers.get(label).map_or(0.0, |p| p.value(t)),
                BoundInput::Pace(None) => 0.0,
                BoundInput::Evaluations => self.evaluations as f64,
                BoundInput::Realtime => realtime,
            };
        }
    }

    /// Derivatives of the (possibly augmented) state `y` at the bound inputs
    /// last set.
    fn evaluate(&mut self, program: &KernelProgram, y: &[f64], out: &mut [f64]) {
        let n = program.state_count();
        let b = program.layout.bound;
        let nb = self.bound.len();
        if self.duals.is_empty() {
            self.frame[..n].copy_from_slice(&y[..n]);
            self.frame[b..b + nb].copy_from_slice(&self.bound);
            run_equations(program, &mut self.frame, &mut self.stack, &mut out[..n]);
            return;
        }
        for (k, frame) in self.duals.iter_mut().enumerate() {
            let row = &y[n * (k + 1)..n * (k + 2)];
            for i in 0..n {
                frame[i] = Dual::new(y[i], row[i]);
            }
            for (j, &value) in self.bound.iter().enumerate() {
                frame[b + j] = Dual::new(value, 0.0);
            }
            run_equations(program, frame, &mut self.dual_stack, &mut self.dual_out);
            for (i, d) in self.dual_out.iter().enumerate() {
                if k == 0 {
                    out[i] = d.val;
                }
                out[n * (k + 1) + i] = d.eps;
            }
        }
    }

    fn intermediate(&self, program: &KernelProgram, index: usize) -> f64 {
        let slot = program.layout.intermediates + index;
        match self.duals.first() {
            Some(frame) => frame[slot].val,
            None => self.frame[slot],
        }
    }

    fn intermediate_tangent(&self, program: &KernelProgram, k: usize, index: usize) -> f64 {
        self.duals
            .get(k)
            .map_or(0.0, |frame| frame[program.layout.intermediates + index].eps)
    }
}

/// The right-hand side seen by the solver; counts evaluations.
struct Rhs<'a> {
    program: &'a KernelProgram,
    work: &'a mut Workspace,
}

impl DynamicalSystem for Rhs<'_> {
    fn dimension(&self) -> usize {
        self.program.state_count() * (1 + self.work.duals.len())
    }

    fn apply(&mut self, t: f64, x: &[f64], out: &mut [f64]) {
        self.work.set_bound(self.program, t);
        self.work.evaluations += 1;
        self.work.evaluate(self.program, x, out);
    }
}

/// Per-run state, dropped by `clean`.
struct Run {
    t: f64,
    t1: f64,
    h: Option<f64>,
    log: DataLog,
    columns: Vec<(usize, LogSource)>,
    schedule: LogSchedule,
    log_t0: f64,
    next_log: usize,
    collect: bool,
    sensitivities: Vec<Vec<Vec<f64>>>,
    root: Option<RootFinding>,
    crossings: Vec<(f64, i8)>,
}

impl Run {
    /// Next scheduled (non-dynamic) log point before the end time.
    fn next_log_time(&self) -> Option<f64> {
        let t = match &self.schedule {
            LogSchedule::Dynamic => return None,
            LogSchedule::Periodic(interval) => self.log_t0 + self.next_log as f64 * interval,
            LogSchedule::Times(times) => *times.get(self.next_log)?,
        };
        (t < self.t1).then_some(t)
    }

    fn records(&self) -> bool {
        !self.columns.is_empty() || self.collect
    }
}

/// Kernel that interprets a compiled [`KernelProgram`].
pub struct VmKernel {
    program: KernelProgram,
    settings: SolverSettings,
    work: Workspace,
    solver: DormandPrince,
    y: Vec<f64>,
    y_new: Vec<f64>,
    f0: Vec<f64>,
    f1: Vec<f64>,
    scratch: Vec<f64>,
    f_scratch: Vec<f64>,
    bound: Vec<f64>,
    steps: u64,
    run: Option<Run>,
}

impl VmKernel {
    pub fn new(program: KernelProgram) -> Self {
        let n = program.state_count();
        let dim = n * (1 + program.independents.len());
        let mut y = vec![0.0; dim];
        for (value, state) in y.iter_mut().zip(program.model.states()) {
            *value = state.initial;
        }
        Self {
            work: Workspace::new(&program, true),
            solver: DormandPrince::new(dim),
            y,
            y_new: vec![0.0; dim],
            f0: vec![0.0; dim],
            f1: vec![0.0; dim],
            scratch: vec![0.0; dim],
            f_scratch: vec![0.0; dim],
            bound: vec![0.0; program.bound.len()],
            settings: SolverSettings::default(),
            steps: 0,
            run: None,
            program,
        }
    }

    pub fn program(&self) -> &KernelProgram {
        &self.program
    }

    pub fn settings(&self) -> SolverSettings {
        self.settings
    }

    fn check_init(&self, init: &KernelInit) -> Result<(), KernelError> {
        let n = self.program.state_count();
        let m = self.program.independents.len();
        let fail = |message: String| Err(KernelError::Argument(message));
        if !init.t0.is_finite() || !init.t1.is_finite() || init.t1 < init.t0 {
            return fail(format!("invalid interval [{}, {})", init.t0, init.t1));
        }
        if init.state.len() != n {
            return fail(format!("expected {n} states, got {}", init.state.len()));
        }
        if init.sensitivity_state.len() != m || init.sensitivity_state.iter().any(|row| row.len() != n) {
            return fail(format!("expected a {m} x {n} sensitivity state"));
        }
        if init.protocols.len() != self.program.labels.len() {
            return fail(format!(
                "expected {} protocols, got {}",
                self.program.labels.len(),
                init.protocols.len()
            ));
        }
        for column in &init.log_columns {
            let in_range = match column.source {
                LogSource::State(i) | LogSource::Derivative(i) => i < n,
                LogSource::Bound(i) => i < self.program.bound.len(),
                LogSource::Intermediate(i) => i < self.program.model.intermediates().len(),
            };
            if !in_range {
                return fail(format!("log column {} refers to an unknown variable", column.key));
            }
        }
        match &init.log_schedule {
            LogSchedule::Periodic(interval) if !(interval.is_finite() && *interval > 0.0) => {
                return fail(format!("invalid log interval {interval}"));
            }
            LogSchedule::Times(times) if times.windows(2).any(|w| w[1] < w[0]) => {
                return fail("log times must be non-decreasing".to_string());
            }
            _ => {}
        }
        if let Some(root) = init.root {
            if root.state >= n {
                return fail(format!("root finding state index {} out of range", root.state));
            }
        }
        if init.sensitivities && m == 0 {
            return fail("no independents to collect sensitivities for".to_string());
        }
        Ok(())
    }

    fn advance(&mut self, run: &mut Run) -> Result<f64, StepFailure> {
        if run.t >= run.t1 {
            return Ok(run.t);
        }
        let Self {
            program,
            settings,
            work,
            solver,
            y,
            y_new,
            f0,
            f1,
            scratch,
            f_scratch,
            bound,
            steps,
            ..
        } = self;
        let program: &KernelProgram = program;
        let n = program.state_count();
        let tol = Tolerance {
            abs: settings.abs_tol,
            rel: settings.rel_tol,
            dims: n,
        };
        let t = run.t;
        let t_stop = work.pacers.iter().map(Pacer::next_time).fold(run.t1, f64::min);

        let mut rhs = Rhs {
            program,
            work: &mut *work,
        };
        rhs.apply(t, y, f0);
        if let Some(i) = f0.iter().position(|v| !v.is_finite()) {
            let name = program
                .model
                .states()
                .get(i)
                .map_or_else(|| format!("sensitivity component {i}"), |s| format!("<{}>", s.name));
            return Err(numerical(
                FailureCode::NonFiniteDerivative,
                format!("Derivative of {name} is {} at t = {t}", f0[i]),
            ));
        }

        let mut h = match run.h {
            Some(h) => h,
            None => initial_step(&mut rhs, t, y, f0, &tol, DormandPrince::ORDER),
        };
        if settings.max_step > 0.0 {
            h = h.min(settings.max_step);
        }
        if settings.min_step > 0.0 {
            h = h.max(settings.min_step);
        }

        let mut failures = 0;
        let (t_new, h_taken, h_next) = loop {
            let remaining = t_stop - t;
            let clamped = h >= remaining;
            let h_try = if clamped { remaining } else { h };
            let err = solver.attempt(&mut rhs, t, y, f0, h_try, &tol, y_new, f1);
            if err <= 1.0 {
                let factor = if err == 0.0 {
                    MAX_GROWTH
                } else {
                    (SAFETY * err.powf(-0.2)).clamp(MIN_SHRINK, MAX_GROWTH)
                };
                let next = if clamped { h } else { h_try * factor };
                // Land exactly on event boundaries and the end time.
                let t_new = if clamped { t_stop } else { t + h_try };
                break (t_new, h_try, next);
            }

            failures += 1;
            if failures >= MAX_ERROR_TEST_FAILURES {
                return Err(numerical(
                    FailureCode::RepeatedErrorTestFailure,
                    format!("Error test failed {failures} times in a row at t = {t} (last step size {h_try:e})"),
                ));
            }
            let factor = if err.is_finite() {
                (SAFETY * err.powf(-0.2)).max(MIN_SHRINK)
            } else {
                MIN_SHRINK
            };
            h = h_try * factor;
            if settings.min_step > 0.0 && h < settings.min_step {
                return Err(numerical(
                    FailureCode::StepSizeTooSmall,
                    format!(
                        "Step size {h:e} at t = {t} is below the minimum step size {:e}",
                        settings.min_step
                    ),
                ));
            }
            if !(h > 16.0 * f64::EPSILON * t.abs()) {
                return Err(numerical(
                    FailureCode::StepSizeTooSmall,
                    format!("Step size {h:e} at t = {t} is below the time resolution"),
                ));
            }
        };

        if let Some(root) = run.root {
            if let Some(crossing) = locate_crossing(root, t, h_taken, y, y_new, f0, f1) {
                run.crossings.push(crossing);
            }
        }

        // Points inside the step still see the pacing from before it.
        if run.records() {
            while let Some(tl) = run.next_log_time() {
                if tl >= t_new {
                    break;
                }
                let theta = ((tl - t) / h_taken).clamp(0.0, 1.0);
                hermite(theta, h_taken, y, y_new, f0, f1, scratch);
                record(program, work, run, tl, scratch, f_scratch);
                run.next_log += 1;
            }
        }

        for pacer in work.pacers.iter_mut() {
            pacer
                .advance(t_new)
                .map_err(|err| StepFailure::Fatal(err.to_string()))?;
        }
        y.copy_from_slice(y_new);
        run.t = t_new;
        run.h = Some(h_next);
        *steps += 1;
        work.set_bound(program, t_new);
        bound.copy_from_slice(&work.bound);

        if run.records() {
            if matches!(run.schedule, LogSchedule::Dynamic) {
                record(program, work, run, t_new, y, f_scratch);
            } else if run.next_log_time() == Some(t_new) {
                record(program, work, run, t_new, y, f_scratch);
                run.next_log += 1;
            }
        }

        trace!(t = t_new, h = h_taken, rejected = failures, "step accepted");
        Ok(t_new)
    }
}

fn numerical(code: FailureCode, message: String) -> StepFailure {
    StepFailure::Numerical { code, message }
}

/// Evaluates the model at `(t, y)` and appends one log row (and one
/// sensitivity matrix if requested).
fn record(program: &KernelProgram, work: &mut Workspace, run: &mut Run, t: f64, y: &[f64], f: &mut [f64]) {
    work.set_bound(program, t);
    work.evaluate(program, y, f);
    for &(column, source) in &run.columns {
        let value = match source {
            LogSource::State(i) => y[i],
            LogSource::Derivative(i) => f[i],
            LogSource::Bound(i) => work.bound[i],
            LogSource::Intermediate(i) => work.intermediate(program, i),
        };
        if let Some(column) = run.log.column_mut(column) {
            column.push(value);
        }
    }
    if run.collect {
        let n = program.state_count();
        let matrix = program
            .dependents
            .iter()
            .map(|dependent| {
                (0..program.independents.len())
                    .map(|k| match *dependent {
                        Dependent::State(i) => y[n * (k + 1) + i],
                        Dependent::Intermediate(i) => work.intermediate_tangent(program, k, i),
                    })
                    .collect()
            })
            .collect();
        run.sensitivities.push(matrix);
    }
}

/// Finds where the interpolated root variable crosses the threshold within a
/// step, by bisection. Returns the crossing time and direction (+1 upward).
fn locate_crossing(
    root: RootFinding,
    t: f64,
    h: f64,
    y0: &[f64],
    y1: &[f64],
    f0: &[f64],
    f1: &[f64],
) -> Option<(f64, i8)> {
    let i = root.state;
    let above_start = y0[i] >= root.threshold;
    let above_end = y1[i] >= root.threshold;
    if above_start == above_end {
        return None;
    }
    let (mut lo, mut hi) = (0.0, 1.0);
    for _ in 0..ROOT_BISECTIONS {
        let mid = 0.5 * (lo + hi);
        let value = hermite_component(mid, h, y0[i], y1[i], f0[i], f1[i]);
        if (value >= root.threshold) == above_start {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Some((t + hi * h, if above_end { 1 } else { -1 }))
}

impl Kernel for VmKernel {
    fn name(&self) -> &str {
        &self.program.module
    }

    fn init(&mut self, init: KernelInit) -> Result<(), KernelError> {
        self.check_init(&init)?;
        let n = self.program.state_count();
        self.work
            .load_constants(&self.program, &init.literals, &init.parameters)?;
        self.work.pacers = self
            .program
            .labels
            .iter()
            .zip(&init.protocols)
            .map(|(_, protocol)| Pacer::start(protocol.as_ref(), init.t0))
            .collect::<Result<_, _>>()
            .map_err(|err| KernelError::Argument(err.to_string()))?;
        self.work.evaluations = 0;
        self.work.started = Instant::now();
        self.steps = 0;

        self.y[..n].copy_from_slice(&init.state);
        for (k, row) in init.sensitivity_state.iter().enumerate() {
            self.y[n * (k + 1)..n * (k + 2)].copy_from_slice(row);
        }

        let mut log = init.log;
        let mut columns = Vec::with_capacity(init.log_columns.len());
        for column in &init.log_columns {
            log.ensure_column(&column.key);
            let index = log
                .column_index(&column.key)
                .ok_or_else(|| KernelError::Fatal(format!("missing log column {}", column.key)))?;
            columns.push((index, column.source));
        }

        let mut run = Run {
            t: init.t0,
            t1: init.t1,
            h: None,
            log,
            columns,
            schedule: init.log_schedule,
            log_t0: init.t0,
            next_log: 0,
            collect: init.sensitivities,
            sensitivities: Vec::new(),
            root: init.root,
            crossings: Vec::new(),
        };
        // A log that already ends at t0 keeps its last sample.
        let continues_log = run.log.last_time() == Some(init.t0);
        while run
            .next_log_time()
            .is_some_and(|t| t < init.t0 || (continues_log && t == init.t0))
        {
            run.next_log += 1;
        }

        self.work.set_bound(&self.program, init.t0);
        self.bound.copy_from_slice(&self.work.bound);
        if matches!(run.schedule, LogSchedule::Dynamic) && run.records() && !continues_log {
            record(
                &self.program,
                &mut self.work,
                &mut run,
                init.t0,
                &self.y,
                &mut self.f_scratch,
            );
        }

        debug!(
            kernel = %self.program.module,
            t0 = init.t0,
            t1 = init.t1,
            "kernel initialised"
        );
        self.run = Some(run);
        Ok(())
    }

    fn step(&mut self) -> Result<f64, StepFailure> {
        let mut run = self.run.take().ok_or(KernelError::NotInitialised)?;
        let result = self.advance(&mut run);
        self.run = Some(run);
        result
    }

    fn clean(&mut self) {
        if self.run.take().is_some() {
            debug!(
                kernel = %self.program.module,
                steps = self.steps,
                evaluations = self.work.evaluations,
                "kernel cleaned"
            );
        }
    }

    fn evaluate_derivatives(&self, inputs: &DerivativeInputs<'_>) -> Result<Vec<f64>, KernelError> {
        let n = self.program.state_count();
        if inputs.state.len() != n {
            return Err(KernelError::Argument(format!(
                "expected {n} states, got {}",
                inputs.state.len()
            )));
        }
        if inputs.pacing.len() != self.program.labels.len() {
            return Err(KernelError::Argument(format!(
                "expected {} pacing values, got {}",
                self.program.labels.len(),
                inputs.pacing.len()
            )));
        }
        let mut work = Workspace::new(&self.program, false);
        work.load_constants(&self.program, inputs.literals, inputs.parameters)?;
        for (value, input) in work.bound.iter_mut().zip(&self.program.bound) {
            *value = match *input {
                BoundInput::Time => inputs.time,
                BoundInput::Pace(Some(label)) => inputs.pacing.get(label).copied().unwrap_or(0.0),
                BoundInput::Pace(None) => 0.0,
                BoundInput::Evaluations => inputs.evaluations,
                BoundInput::Realtime => inputs.realtime,
            };
        }
        let mut out = vec![0.0; n];
        work.evaluate(&self.program, inputs.state, &mut out);
        Ok(out)
    }

    fn number_of_evaluations(&self) -> u64 {
        self.work.evaluations
    }

    fn number_of_steps(&self) -> u64 {
        self.steps
    }

    fn set_tolerance(&mut self, abs_tol: f64, rel_tol: f64) {
        self.settings.abs_tol = abs_tol;
        self.settings.rel_tol = rel_tol;
    }

    fn set_min_step_size(&mut self, dt: f64) {
        self.settings.min_step = dt;
    }

    fn set_max_step_size(&mut self, dt: f64) {
        self.settings.max_step = dt;
    }

    fn state(&self) -> &[f64] {
        &self.y[..self.program.state_count()]
    }

    fn sensitivity_state(&self) -> Vec<Vec<f64>> {
        let n = self.program.state_count();
        self.y[n..].chunks(n.max(1)).map(<[f64]>::to_vec).collect()
    }

    fn bound_values(&self) -> &[f64] {
        &self.bound
    }

    fn take_output(&mut self) -> KernelOutput {
        match self.run.as_mut() {
            Some(run) => KernelOutput {
                log: std::mem::take(&mut run.log),
                sensitivities: std::mem::take(&mut run.sensitivities),
                crossings: std::mem::take(&mut run.crossings),
            },
            None => KernelOutput::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{LogColumn, SolverSettings};
    use crate::model::{tests::fitzhugh_nagumo, Binding, Model, SensitivitySpec};
    use crate::protocol::{blocktrain, PacingProtocol, Protocol};
    use crate::source::KernelSource;

    fn kernel(model: Model, labels: &[&str], spec: Option<SensitivitySpec>) -> VmKernel {
        let source = KernelSource {
            module: "vm_test".to_string(),
            model,
            labels: labels.iter().map(|l| l.to_string()).collect(),
            sensitivities: spec,
        };
        VmKernel::new(KernelProgram::compile(&source, true).expect("compile"))
    }

    fn decay() -> Model {
        let mut model = Model::new("decay");
        model
            .add_state("x", 1.0, "-k * x")
            .and_then(|m| m.add_literal("k", 0.5))
            .and_then(|m| m.add_bound("t", Binding::Time))
            .expect("valid model");
        model
    }

    fn init(kernel: &VmKernel, t1: f64) -> KernelInit {
        let program = kernel.program();
        let n = program.state_count();
        KernelInit {
            t0: 0.0,
            t1,
            state: program.model.initial_state(),
            sensitivity_state: program
                .independents
                .iter()
                .map(|i| {
                    let mut row = vec![0.0; n];
                    if let ProgramIndependent::InitialValue(s) = *i {
                        row[s] = 1.0;
                    }
                    row
                })
                .collect(),
            literals: program.model.literals().iter().map(|l| l.value).collect(),
            parameters: program
                .parameter_literals()
                .iter()
                .map(|&i| program.model.literals()[i].value)
                .collect(),
            protocols: vec![None; program.labels.len()],
            log: DataLog::new("t"),
            log_columns: Vec::new(),
            log_schedule: LogSchedule::Dynamic,
            sensitivities: false,
            root: None,
        }
    }

    fn run_to_end(kernel: &mut VmKernel, t1: f64) {
        let mut t = f64::NEG_INFINITY;
        while t < t1 {
            t = kernel.step().expect("step");
        }
        assert_eq!(t, t1);
    }

    #[test]
    fn integrates_decay_to_tolerance() {
        let mut k = kernel(decay(), &[], None);
        k.set_tolerance(1e-10, 1e-10);
        let settings = init(&k, 4.0);
        k.init(settings).expect("init");
        run_to_end(&mut k, 4.0);
        assert!((k.state()[0] - (-2.0f64).exp()).abs() < 1e-8);
        assert!(k.number_of_steps() > 0);
        assert!(k.number_of_evaluations() > k.number_of_steps());
        assert_eq!(k.step(), Ok(4.0));
    }

    #[test]
    fn step_without_init_is_fatal() {
        let mut k = kernel(decay(), &[], None);
        assert!(matches!(k.step(), Err(StepFailure::Fatal(_))));
    }

    #[test]
    fn sensitivities_match_analytic_solution() {
        let spec = SensitivitySpec::new(["x"], ["k", "init(x)"]).expect("spec");
        let mut k = kernel(decay(), &[], Some(spec));
        k.set_tolerance(1e-10, 1e-10);
        let mut settings = init(&k, 2.0);
        settings.sensitivities = true;
        settings.log_schedule = LogSchedule::Times(vec![1.0]);
        k.init(settings).expect("init");
        run_to_end(&mut k, 2.0);

        let x = (-1.0f64).exp();
        let s = k.sensitivity_state();
        assert!((s[0][0] - (-2.0 * x)).abs() < 1e-6, "dx/dk = {}", s[0][0]);
        assert!((s[1][0] - x).abs() < 1e-6, "dx/dx0 = {}", s[1][0]);

        let output = k.take_output();
        assert_eq!(output.sensitivities.len(), 1);
        let at_one = &output.sensitivities[0][0];
        let x1 = (-0.5f64).exp();
        assert!((at_one[0] + x1).abs() < 1e-6);
        assert!((at_one[1] - x1).abs() < 1e-6);
    }

    #[test]
    fn steps_land_on_pacing_boundaries() {
        let mut model = Model::new("integrator");
        model
            .add_state("x", 0.0, "p")
            .and_then(|m| m.add_bound("p", Binding::Pace("stim".to_string())))
            .and_then(|m| m.add_bound("t", Binding::Time))
            .expect("valid model");
        let mut k = kernel(model, &["stim"], None);
        let mut protocol = Protocol::new();
        protocol.schedule(1.0, 1.0, 1.5, 0.0, 0).expect("event");
        let mut settings = init(&k, 5.0);
        settings.protocols = vec![Some(PacingProtocol::Events(protocol))];
        settings.log_columns = vec![LogColumn {
            key: "t".to_string(),
            source: LogSource::Bound(1),
        }];
        k.init(settings).expect("init");
        run_to_end(&mut k, 5.0);
        assert!((k.state()[0] - 1.5).abs() < 1e-12);
        let log = k.take_output().log;
        assert!(log.time().contains(&1.0));
        assert!(log.time().contains(&2.5));
    }

    #[test]
    fn periodic_logging_interpolates_inside_steps() {
        let mut k = kernel(decay(), &[], None);
        k.set_tolerance(1e-10, 1e-10);
        let mut settings = init(&k, 3.0);
        settings.log_schedule = LogSchedule::Periodic(0.5);
        settings.log_columns = vec![
            LogColumn {
                key: "t".to_string(),
                source: LogSource::Bound(0),
            },
            LogColumn {
                key: "x".to_string(),
                source: LogSource::State(0),
            },
            LogColumn {
                key: "dot(x)".to_string(),
                source: LogSource::Derivative(0),
            },
        ];
        k.init(settings).expect("init");
        run_to_end(&mut k, 3.0);
        let log = k.take_output().log;
        assert_eq!(log.time(), &[0.0, 0.5, 1.0, 1.5, 2.0, 2.5]);
        for (t, x) in log.time().iter().zip(log.get("x").expect("x")) {
            assert!((x - (-0.5 * t).exp()).abs() < 1e-5);
        }
        let dx = log.get("dot(x)").expect("derivative");
        assert!((dx[0] + 0.5).abs() < 1e-12);
    }

    #[test]
    fn dynamic_logging_skips_an_already_logged_start() {
        let mut k = kernel(decay(), &[], None);
        let mut log = DataLog::new("t");
        log.push("t", 0.0);
        let mut settings = init(&k, 1.0);
        settings.log = log;
        settings.log_columns = vec![LogColumn {
            key: "t".to_string(),
            source: LogSource::Bound(0),
        }];
        k.init(settings).expect("init");
        run_to_end(&mut k, 1.0);
        let times = k.take_output().log.time().to_vec();
        assert_eq!(times.iter().filter(|&&t| t == 0.0).count(), 1);
        assert_eq!(times.last(), Some(&1.0));
        assert!(times.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn root_finding_reports_both_directions() {
        let mut k = kernel(fitzhugh_nagumo(), &["pace"], None);
        let mut settings = init(&k, 400.0);
        let protocol = blocktrain(200.0, 5.0, 10.0, 1.0, 0).expect("protocol");
        settings.protocols = vec![Some(protocol.into())];
        settings.root = Some(RootFinding {
            state: 0,
            threshold: 0.0,
        });
        k.init(settings).expect("init");
        run_to_end(&mut k, 400.0);
        let crossings = k.take_output().crossings;
        assert!(crossings.len() >= 2, "{crossings:?}");
        assert_eq!(crossings[0].1, 1);
        assert_eq!(crossings[1].1, -1);
        assert!(crossings[0].0 > 10.0);
        assert!(crossings.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn blow_up_is_a_numerical_failure() {
        let mut model = Model::new("blowup");
        model.add_state("x", 1.0, "x * x").expect("valid model");
        let mut k = kernel(model, &[], None);
        let settings = init(&k, 10.0);
        k.init(settings).expect("init");
        let failure = loop {
            match k.step() {
                Ok(t) => assert!(t < 10.0, "passed the singularity"),
                Err(failure) => break failure,
            }
        };
        assert!(matches!(failure, StepFailure::Numerical { .. }), "{failure:?}");
        assert!(k.state()[0] > 1.0);
    }

    #[test]
    fn minimum_step_size_is_enforced() {
        let mut model = Model::new("stiff");
        model
            .add_state("x", 1.0, "-1e6 * (x - cos(t))")
            .and_then(|m| m.add_bound("t", Binding::Time))
            .expect("valid model");
        let mut k = kernel(model, &[], None);
        k.set_min_step_size(0.1);
        let settings = init(&k, 1.0);
        k.init(settings).expect("init");
        let failure = k.step().expect_err("step too large for the dynamics");
        assert!(matches!(
            failure,
            StepFailure::Numerical {
                code: FailureCode::StepSizeTooSmall,
                ..
            }
        ));
    }

    #[test]
    fn evaluate_derivatives_uses_given_inputs_only() {
        let k = kernel(fitzhugh_nagumo(), &["pace"], None);
        let literals = [0.7, 0.8, 1.5];
        let derivatives = k
            .evaluate_derivatives(&DerivativeInputs {
                time: 3.0,
                pacing: &[1.0],
                realtime: 0.0,
                evaluations: 0.0,
                literals: &literals,
                parameters: &[],
                state: &[0.0, 0.0],
            })
            .expect("evaluate");
        assert!((derivatives[0] - 1.5).abs() < 1e-15);
        assert!((derivatives[1] - 0.08 * 0.7).abs() < 1e-15);
        assert!(k
            .evaluate_derivatives(&DerivativeInputs {
                time: 0.0,
                pacing: &[],
                realtime: 0.0,
                evaluations: 0.0,
                literals: &literals,
                parameters: &[],
                state: &[0.0, 0.0],
            })
            .is_err());
        assert_eq!(k.settings(), SolverSettings::default());
    }

    #[test]
    fn init_rejects_mismatched_arguments() {
        let mut k = kernel(decay(), &[], None);
        let mut settings = init(&k, 1.0);
        settings.state = vec![1.0, 2.0];
        assert!(matches!(k.init(settings), Err(KernelError::Argument(_))));
        let mut settings = init(&k, 1.0);
        settings.log_schedule = LogSchedule::Periodic(0.0);
        assert!(k.init(settings).is_err());
    }
}
