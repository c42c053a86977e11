use crate::equation_engine::{parse, Bytecode, Compiler};
use crate::model::{Binding, Independent, Model, SensitivitySpec, VariableKind};
use crate::source::KernelSource;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// Version of the serialized program layout.
pub const PROGRAM_FORMAT: u32 = 1;

/// What a bound slot is filled with while stepping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundInput {
    Time,
    /// Index into the kernel labels, or `None` for a label the kernel was
    /// not built with (always zero).
    Pace(Option<usize>),
    Evaluations,
    Realtime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dependent {
    State(usize),
    Intermediate(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgramIndependent {
    /// Index into the model literals.
    Literal(usize),
    /// Index into the model states.
    InitialValue(usize),
}

/// An equation compiled to write one frame slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledEquation {
    pub slot: usize,
    pub code: Bytecode,
}

/// Offsets of each variable group in the evaluation frame:
/// `[states | bound | literals | derived | intermediates]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLayout {
    pub bound: usize,
    pub literals: usize,
    pub derived: usize,
    pub intermediates: usize,
    pub len: usize,
}

/// The compiled form of a kernel source; this is the build artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelProgram {
    pub format: u32,
    pub module: String,
    pub model: Model,
    pub labels: Vec<String>,
    pub layout: FrameLayout,
    pub bound: Vec<BoundInput>,
    /// Derived constants in evaluation order.
    pub derived: Vec<CompiledEquation>,
    /// Intermediates in evaluation order.
    pub intermediates: Vec<CompiledEquation>,
    /// One right-hand side per state, in model order.
    pub rhs: Vec<Bytecode>,
    pub dependents: Vec<Dependent>,
    pub independents: Vec<ProgramIndependent>,
}

impl KernelProgram {
    /// Compiles every equation of `source` against the frame layout.
    pub fn compile(source: &KernelSource, fold_constants: bool) -> Result<Self> {
        let model = &source.model;
        let order = model.solved_order().context("invalid model")?;

        let n = model.count_states();
        let layout = FrameLayout {
            bound: n,
            literals: n + model.bound().len(),
            derived: n + model.bound().len() + model.literals().len(),
            intermediates: n + model.bound().len() + model.literals().len() + model.derived().len(),
            len: n
                + model.bound().len()
                + model.literals().len()
                + model.derived().len()
                + model.intermediates().len(),
        };

        let names: Vec<String> = model
            .states()
            .iter()
            .map(|s| s.name.clone())
            .chain(model.bound().iter().map(|b| b.name.clone()))
            .chain(model.literals().iter().map(|l| l.name.clone()))
            .chain(model.derived().iter().map(|e| e.name.clone()))
            .chain(model.intermediates().iter().map(|e| e.name.clone()))
            .collect();
        let mut compiler = Compiler::new(&names);
        compiler.fold_constants = fold_constants;

        let compile = |name: &str, expression: &str| -> Result<Bytecode> {
            let expr = parse(expression).with_context(|| format!("in equation for <{name}>"))?;
            compiler
                .compile(&expr)
                .with_context(|| format!("in equation for <{name}>"))
        };

        let derived = order
            .derived
            .iter()
            .map(|&i| {
                let eq = &model.derived()[i];
                Ok(CompiledEquation {
                    slot: layout.derived + i,
                    code: compile(&eq.name, &eq.expression)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let intermediates = order
            .intermediates
            .iter()
            .map(|&i| {
                let eq = &model.intermediates()[i];
                Ok(CompiledEquation {
                    slot: layout.intermediates + i,
                    code: compile(&eq.name, &eq.expression)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let rhs = model
            .states()
            .iter()
            .map(|s| compile(&s.name, &s.rhs))
            .collect::<Result<Vec<_>>>()?;

        let bound = model
            .bound()
            .iter()
            .map(|b| match &b.binding {
                Binding::Time => BoundInput::Time,
                Binding::Pace(label) => BoundInput::Pace(source.labels.iter().position(|l| l == label)),
                Binding::Evaluations => BoundInput::Evaluations,
                Binding::Realtime => BoundInput::Realtime,
            })
            .collect();

        let (dependents, independents) = match &source.sensitivities {
            Some(spec) => resolve_sensitivities(model, spec)?,
            None => (Vec::new(), Vec::new()),
        };

        Ok(Self {
            format: PROGRAM_FORMAT,
            module: source.module.clone(),
            model: model.clone(),
            labels: source.labels.clone(),
            layout,
            bound,
            derived,
            intermediates,
            rhs,
            dependents,
            independents,
        })
    }

    pub fn state_count(&self) -> usize {
        self.rhs.len()
    }

    /// Literal indices of the literal independents, in independent order.
    pub fn parameter_literals(&self) -> Vec<usize> {
        self.independents
            .iter()
            .filter_map(|i| match i {
                ProgramIndependent::Literal(index) => Some(*index),
                ProgramIndependent::InitialValue(_) => None,
            })
            .collect()
    }
}

fn resolve_sensitivities(
    model: &Model,
    spec: &SensitivitySpec,
) -> Result<(Vec<Dependent>, Vec<ProgramIndependent>)> {
    spec.validate(model).context("invalid sensitivities")?;
    let dependents = spec
        .dependents
        .iter()
        .map(|name| {
            let resolved = match model.kind_of(name) {
                Some(VariableKind::State) => model.state_index(name).map(Dependent::State),
                Some(VariableKind::Intermediate) => model
                    .intermediates()
                    .iter()
                    .position(|e| &e.name == name)
                    .map(Dependent::Intermediate),
                _ => None,
            };
            resolved.ok_or_else(|| anyhow!("cannot resolve dependent <{name}>"))
        })
        .collect::<Result<Vec<_>>>()?;
    let independents = spec
        .independents
        .iter()
        .map(|indep| match indep {
            Independent::Literal(name) => model
                .literal_index(name)
                .map(ProgramIndependent::Literal)
                .ok_or_else(|| anyhow!("cannot resolve independent <{name}>")),
            Independent::InitialValue(name) => model
                .state_index(name)
                .map(ProgramIndependent::InitialValue)
                .ok_or_else(|| anyhow!("cannot resolve independent init({name})")),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((dependents, independents))
}
