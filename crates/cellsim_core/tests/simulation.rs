use cellsim_core::error::{ConfigError, Error, FailureCode, KernelError};
use cellsim_core::kernel::{DerivativeInputs, Kernel, KernelInit, KernelOutput, StepFailure};
use cellsim_core::log::{LogFlags, LogSpec};
use cellsim_core::model::{Binding, Model, SensitivitySpec};
use cellsim_core::protocol::blocktrain;
use cellsim_core::simulation::{RunOptions, Simulation};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Calls {
    init: AtomicUsize,
    step: AtomicUsize,
    clean: AtomicUsize,
    fail: AtomicBool,
    collects_sensitivities: AtomicBool,
}

impl Calls {
    fn count(&self) -> (usize, usize, usize) {
        (
            self.init.load(Ordering::SeqCst),
            self.step.load(Ordering::SeqCst),
            self.clean.load(Ordering::SeqCst),
        )
    }
}

/// Halves the state in four equal steps per run and records every call.
struct StubKernel {
    calls: Arc<Calls>,
    state: Vec<f64>,
    bound: Vec<f64>,
    t0: f64,
    t1: f64,
    steps: u32,
}

impl StubKernel {
    fn boxed(calls: &Arc<Calls>) -> Box<dyn Kernel> {
        Box::new(StubKernel {
            calls: Arc::clone(calls),
            state: vec![0.0],
            bound: vec![0.0],
            t0: 0.0,
            t1: 0.0,
            steps: 0,
        })
    }
}

impl Kernel for StubKernel {
    fn name(&self) -> &str {
        "stub"
    }

    fn init(&mut self, init: KernelInit) -> Result<(), KernelError> {
        self.calls.init.fetch_add(1, Ordering::SeqCst);
        self.calls
            .collects_sensitivities
            .store(init.sensitivities, Ordering::SeqCst);
        self.state = init.state;
        self.t0 = init.t0;
        self.t1 = init.t1;
        self.steps = 0;
        self.bound = vec![init.t0];
        Ok(())
    }

    fn step(&mut self) -> Result<f64, StepFailure> {
        self.calls.step.fetch_add(1, Ordering::SeqCst);
        if self.calls.fail.load(Ordering::SeqCst) {
            return Err(StepFailure::Numerical {
                code: FailureCode::StepSizeTooSmall,
                message: "stub failure".to_string(),
            });
        }
        self.steps += 1;
        let t = if self.steps >= 4 {
            self.t1
        } else {
            self.t0 + f64::from(self.steps) * (self.t1 - self.t0) / 4.0
        };
        for x in &mut self.state {
            *x *= 0.5f64.powf(0.25);
        }
        self.bound = vec![t];
        Ok(t)
    }

    fn clean(&mut self) {
        self.calls.clean.fetch_add(1, Ordering::SeqCst);
    }

    fn evaluate_derivatives(&self, inputs: &DerivativeInputs<'_>) -> Result<Vec<f64>, KernelError> {
        Ok(inputs.state.iter().map(|x| -x).collect())
    }

    fn number_of_evaluations(&self) -> u64 {
        self.calls.step.load(Ordering::SeqCst) as u64
    }

    fn number_of_steps(&self) -> u64 {
        self.calls.step.load(Ordering::SeqCst) as u64
    }

    fn set_tolerance(&mut self, _abs_tol: f64, _rel_tol: f64) {}

    fn set_min_step_size(&mut self, _dt: f64) {}

    fn set_max_step_size(&mut self, _dt: f64) {}

    fn state(&self) -> &[f64] {
        &self.state
    }

    fn sensitivity_state(&self) -> Vec<Vec<f64>> {
        Vec::new()
    }

    fn bound_values(&self) -> &[f64] {
        &self.bound
    }

    fn take_output(&mut self) -> KernelOutput {
        KernelOutput::default()
    }
}

fn decay() -> Model {
    let mut model = Model::new("decay");
    model
        .add_state("x", 1.0, "-k * x")
        .and_then(|m| m.add_literal("k", 1.0))
        .and_then(|m| m.add_bound("t", Binding::Time))
        .expect("model");
    model
}

fn blow_up() -> Model {
    let mut model = Model::new("blow_up");
    model
        .add_state("x", 1.0, "k * x^2")
        .and_then(|m| m.add_literal("k", 1.0))
        .and_then(|m| m.add_bound("t", Binding::Time))
        .expect("model");
    model
}

fn fitzhugh_nagumo() -> Model {
    let mut model = Model::new("fhn");
    model
        .add_state("V", -1.2, "V - V^3 / 3 - w + i_stim")
        .and_then(|m| m.add_state("w", -0.6, "eps * (V + a - b * w)"))
        .and_then(|m| m.add_literal("a", 0.7))
        .and_then(|m| m.add_literal("b", 0.8))
        .and_then(|m| m.add_literal("amplitude", 1.5))
        .and_then(|m| m.add_derived("eps", "0.08 * b / 0.8"))
        .and_then(|m| m.add_intermediate("i_stim", "amplitude * pace"))
        .and_then(|m| m.add_bound("t", Binding::Time))
        .and_then(|m| m.add_bound("pace", Binding::Pace("pace".to_string())))
        .expect("model");
    model
}

fn stub_simulation(calls: &Arc<Calls>) -> Simulation {
    Simulation::builder(decay())
        .kernel(StubKernel::boxed(calls))
        .build()
        .expect("simulation")
}

#[test]
fn negative_duration_fails_before_the_kernel_is_called() {
    let calls = Arc::new(Calls::default());
    let mut sim = stub_simulation(&calls);
    let result = sim.run(-1.0, RunOptions::default(), None);
    assert!(matches!(result, Err(Error::Config(ConfigError::NegativeDuration(_)))));
    assert!(matches!(sim.pre(-1.0, None), Err(Error::Config(_))));
    assert_eq!(calls.count(), (0, 0, 0));
}

#[test]
fn degenerate_durations_skip_the_kernel() {
    let calls = Arc::new(Calls::default());
    let mut sim = stub_simulation(&calls);
    sim.set_time(1.0).expect("time");

    let out = sim.run(0.0, RunOptions::default(), None).expect("run");
    assert!(out.log.is_empty());
    let out = sim.run(f64::EPSILON / 4.0, RunOptions::default(), None).expect("run");
    assert!(out.log.is_empty());
    sim.pre(f64::EPSILON / 4.0, None).expect("pre");
    assert_eq!(calls.count(), (0, 0, 0));
    assert_eq!(sim.time(), 1.0);
    assert_eq!(sim.state(), &[1.0]);

    sim.run(f64::EPSILON, RunOptions::default(), None).expect("run");
    assert_eq!(calls.count().0, 1);
    assert_eq!(sim.time(), 1.0 + f64::EPSILON);
}

#[test]
fn continuing_a_log_over_a_degenerate_run_keeps_it_unchanged() {
    let mut sim = Simulation::new(decay()).expect("simulation");
    let first = sim.run(2.0, RunOptions::default(), None).expect("run");
    let options = RunOptions {
        log: LogSpec::Continue(first.log.clone()),
        ..RunOptions::default()
    };
    let second = sim.run(0.0, options, None).expect("run");
    assert_eq!(second.log, first.log);

    let options = RunOptions {
        log: LogSpec::Continue(first.log.clone()),
        ..RunOptions::default()
    };
    let third = sim.run(1.0, options, None).expect("run");
    let time = third.log.time();
    assert_eq!(&time[..first.log.len()], first.log.time());
    assert!(time.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn continuing_a_dynamic_log_on_a_schedule_keeps_one_boundary_sample() {
    let mut sim = Simulation::new(decay()).expect("simulation");
    let first = sim.run(2.0, RunOptions::default(), None).expect("run");
    assert_eq!(first.log.last_time(), Some(2.0));

    let options = RunOptions {
        log: LogSpec::Continue(first.log.clone()),
        log_interval: Some(0.5),
        ..RunOptions::default()
    };
    let periodic = sim.run(1.0, options, None).expect("run");
    let time = periodic.log.time();
    assert!(time.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(&time[first.log.len()..], &[2.5]);

    let mut sim = Simulation::new(decay()).expect("simulation");
    let first = sim.run(2.0, RunOptions::default(), None).expect("run");
    let options = RunOptions {
        log: LogSpec::Continue(first.log.clone()),
        log_times: Some(vec![1.0, 2.0, 2.25, 2.5]),
        ..RunOptions::default()
    };
    let fixed = sim.run(1.0, options, None).expect("run");
    let time = fixed.log.time();
    assert!(time.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(&time[first.log.len()..], &[2.25, 2.5]);
}

#[test]
fn degenerate_durations_keep_sensitivities() {
    let spec = SensitivitySpec::new(["x"], ["k", "init(x)"]).expect("spec");
    let mut sim = Simulation::builder(decay())
        .sensitivities(spec)
        .build()
        .expect("simulation");
    sim.run(1.0, RunOptions::default(), None).expect("run");
    let sensitivities = sim.sensitivity_state().to_vec();
    let defaults = sim.default_sensitivity_state().to_vec();
    assert_ne!(sensitivities, defaults);

    let out = sim.run(0.0, RunOptions::default(), None).expect("run");
    assert!(out.log.is_empty());
    sim.pre(f64::EPSILON / 4.0, None).expect("pre");
    assert_eq!(sim.time(), 1.0);
    assert_eq!(sim.sensitivity_state(), sensitivities.as_slice());
    assert_eq!(sim.default_sensitivity_state(), defaults.as_slice());
}

#[test]
fn pre_pacing_does_not_collect_sensitivities() {
    let calls = Arc::new(Calls::default());
    let spec = SensitivitySpec::new(["x"], ["k"]).expect("spec");
    let mut sim = Simulation::builder(decay())
        .sensitivities(spec)
        .kernel(StubKernel::boxed(&calls))
        .build()
        .expect("simulation");

    sim.pre(1.0, None).expect("pre");
    assert_eq!(calls.count().0, 1);
    assert!(!calls.collects_sensitivities.load(Ordering::SeqCst));

    sim.run(1.0, RunOptions::default(), None).expect("run");
    assert_eq!(calls.count().0, 2);
    assert!(calls.collects_sensitivities.load(Ordering::SeqCst));
}

#[test]
fn kernel_is_cleaned_once_on_every_path() {
    let calls = Arc::new(Calls::default());
    let mut sim = stub_simulation(&calls);

    sim.run(1.0, RunOptions::default(), None).expect("run");
    assert_eq!(calls.count(), (1, 4, 1));
    assert!((sim.state()[0] - 0.5).abs() < 1e-12);

    let mut cancel = |_fraction: f64| false;
    let result = sim.run(1.0, RunOptions::default(), Some(&mut cancel));
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(calls.count(), (2, 5, 2));
    assert_eq!(sim.time(), 1.0);

    calls.fail.store(true, Ordering::SeqCst);
    assert!(matches!(
        sim.run(1.0, RunOptions::default(), None),
        Err(Error::Simulation(_))
    ));
    assert_eq!(calls.count(), (3, 6, 3));
}

#[test]
fn stub_failure_reports_the_last_state_and_inputs() {
    let calls = Arc::new(Calls::default());
    let mut sim = stub_simulation(&calls);
    sim.run(1.0, RunOptions::default(), None).expect("run");
    calls.fail.store(true, Ordering::SeqCst);

    let err = match sim.run(1.0, RunOptions::default(), None) {
        Err(Error::Simulation(err)) => err,
        other => panic!("expected a simulation error, got {other:?}"),
    };
    assert_eq!(err.code, FailureCode::StepSizeTooSmall);
    assert_eq!(err.time, 1.0);
    assert_eq!(err.state.len(), 1);
    assert_eq!(err.inputs, vec![("t".to_string(), 1.0)]);
    let derivatives = err.derivatives.as_ref().expect("derivatives");
    assert_eq!(derivatives[0].0, "x");
    assert!((derivatives[0].1 + 0.5).abs() < 1e-12);
    assert!(err.to_string().contains("stub failure"));

    assert_eq!(sim.crash_state().map(<[f64]>::len), Some(1));
    assert_eq!(sim.crash_inputs().map(<[(String, f64)]>::len), Some(1));
    assert_eq!(sim.time(), 1.0);

    calls.fail.store(false, Ordering::SeqCst);
    sim.run(1.0, RunOptions::default(), None).expect("run");
    assert!(sim.crash_state().is_none());
    assert!(sim.crash_inputs().is_none());
}

#[test]
fn numerical_failure_is_recoverable() {
    let mut sim = Simulation::new(blow_up()).expect("simulation");
    let err = match sim.run(2.0, RunOptions::default(), None) {
        Err(Error::Simulation(err)) => err,
        other => panic!("expected a simulation error, got {other:?}"),
    };
    assert!(err.time < 1.0 + 1e-3, "failed at {}", err.time);
    assert_eq!(sim.crash_state().map(<[f64]>::len), Some(1));
    assert!(sim.crash_inputs().is_some());
    assert_eq!(sim.time(), 0.0);
    assert_eq!(sim.state(), &[1.0]);

    sim.set_constant("k", -1.0).expect("constant");
    sim.reset();
    sim.run(2.0, RunOptions::default(), None).expect("run");
    assert!(sim.crash_state().is_none());
    assert!((sim.state()[0] - 1.0 / 3.0).abs() < 1e-3);
}

#[test]
fn pre_then_reset_returns_to_time_zero() {
    let mut sim = Simulation::builder(fitzhugh_nagumo())
        .protocol("pace", blocktrain(50.0, 2.0, 1.0, 1.0, 0).expect("protocol"))
        .build()
        .expect("simulation");
    sim.pre(100.0, None).expect("pre");
    sim.run(25.0, RunOptions::default(), None).expect("run");
    sim.reset();
    assert_eq!(sim.state(), sim.default_state());
    assert_eq!(sim.time(), 0.0);
}

#[test]
fn reset_restores_the_last_default_state() {
    let mut sim = Simulation::new(decay()).expect("simulation");
    sim.set_default_state(&[3.0]).expect("default");
    sim.run(1.0, RunOptions::default(), None).expect("run");
    sim.pre(1.0, None).expect("pre");
    let pre_paced = sim.default_state().to_vec();
    sim.run(1.0, RunOptions::default(), None).expect("run");
    sim.reset();
    assert_eq!(sim.state(), pre_paced.as_slice());
    assert_ne!(pre_paced, vec![3.0]);
}

#[test]
fn serialized_simulations_continue_identically() {
    let spec = SensitivitySpec::new(["V", "i_stim"], ["amplitude", "init(w)"]).expect("spec");
    let mut sim = Simulation::builder(fitzhugh_nagumo())
        .protocol("pace", blocktrain(100.0, 3.0, 5.0, 1.0, 0).expect("protocol"))
        .sensitivities(spec)
        .build()
        .expect("simulation");
    sim.set_tolerance(1e-8, 1e-8).expect("tolerance");
    sim.run(40.0, RunOptions::default(), None).expect("run");

    let json = serde_json::to_string(&sim).expect("serialize");
    let mut copy: Simulation = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(copy.settings(), sim.settings());

    let options = RunOptions {
        log: LogSpec::Flags(LogFlags::STATE),
        ..RunOptions::default()
    };
    let a = sim.run(150.0, options.clone(), None).expect("run");
    let b = copy.run(150.0, options, None).expect("run");
    assert_eq!(sim.time().to_bits(), copy.time().to_bits());
    assert_eq!(sim.state(), copy.state());
    assert_eq!(sim.sensitivity_state(), copy.sensitivity_state());
    assert_eq!(a, b);
}

#[test]
fn archived_simulations_rebuild_without_compiling() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("fhn.kar");
    let mut sim = Simulation::builder(fitzhugh_nagumo())
        .protocol("pace", blocktrain(100.0, 3.0, 5.0, 1.0, 0).expect("protocol"))
        .build()
        .expect("simulation");
    sim.run(10.0, RunOptions::default(), None).expect("run");
    sim.persist(&path).expect("persist");

    let mut loaded = Simulation::from_archive(&path).expect("load");
    assert_eq!(loaded.kernel_name(), sim.kernel_name());
    assert_eq!(loaded.time(), 0.0);
    assert_eq!(loaded.state(), &[-1.2, -0.6]);
    assert!(loaded.protocol("pace").is_some());

    sim.reset();
    sim.run(50.0, RunOptions::default(), None).expect("run");
    loaded.run(50.0, RunOptions::default(), None).expect("run");
    assert_eq!(sim.state(), loaded.state());

    let calls = Arc::new(Calls::default());
    let stub = stub_simulation(&calls);
    assert!(matches!(stub.persist(&path), Err(Error::Archive(_))));
}

#[test]
fn builds_of_live_simulations_get_distinct_kernels() {
    let a = Simulation::new(decay()).expect("simulation");
    let b = Simulation::new(decay()).expect("simulation");
    assert_ne!(a.kernel_name(), b.kernel_name());
    assert!(a.kernel_name().starts_with("decay_"));
}
