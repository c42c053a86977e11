//! Model snapshots: the variables, equations and bindings a kernel is built from.
//!
//! A `Model` is plain data. Expressions are kept as source text and are only
//! parsed for validation here; compiling them is the kernel builder's job.

use crate::equation_engine::parse;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

/// External inputs a model variable can be bound to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Binding {
    Time,
    Pace(String),
    Evaluations,
    Realtime,
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Time => f.write_str("time"),
            Binding::Pace(label) => write!(f, "pace:{label}"),
            Binding::Evaluations => f.write_str("evaluations"),
            Binding::Realtime => f.write_str("realtime"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateVariable {
    pub name: String,
    pub initial: f64,
    pub rhs: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Literal {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Equation {
    pub name: String,
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundVariable {
    pub name: String,
    pub binding: Binding,
}

/// The role a named variable plays in a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    State,
    Literal,
    Derived,
    Intermediate,
    Bound,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Model {
    name: String,
    states: Vec<StateVariable>,
    literals: Vec<Literal>,
    derived: Vec<Equation>,
    intermediates: Vec<Equation>,
    bound: Vec<BoundVariable>,
}

impl Model {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a state variable with its initial value and time derivative.
    pub fn add_state(
        &mut self,
        name: &str,
        initial: f64,
        rhs: &str,
    ) -> Result<&mut Self, ConfigError> {
        self.check_new_name(name)?;
        check_finite("initial value", initial)?;
        self.states.push(StateVariable {
            name: name.to_string(),
            initial,
            rhs: rhs.to_string(),
        });
        Ok(self)
    }

    /// Adds a constant with no dependencies.
    pub fn add_literal(&mut self, name: &str, value: f64) -> Result<&mut Self, ConfigError> {
        self.check_new_name(name)?;
        check_finite("literal value", value)?;
        self.literals.push(Literal {
            name: name.to_string(),
            value,
        });
        Ok(self)
    }

    /// Adds a constant computed from other constants.
    pub fn add_derived(&mut self, name: &str, expression: &str) -> Result<&mut Self, ConfigError> {
        self.check_new_name(name)?;
        self.derived.push(Equation {
            name: name.to_string(),
            expression: expression.to_string(),
        });
        Ok(self)
    }

    pub fn add_intermediate(
        &mut self,
        name: &str,
        expression: &str,
    ) -> Result<&mut Self, ConfigError> {
        self.check_new_name(name)?;
        self.intermediates.push(Equation {
            name: name.to_string(),
            expression: expression.to_string(),
        });
        Ok(self)
    }

    /// Adds a variable whose value is supplied by the simulation.
    pub fn add_bound(&mut self, name: &str, binding: Binding) -> Result<&mut Self, ConfigError> {
        self.check_new_name(name)?;
        if let Some(existing) = self.bound.iter().find(|b| b.binding == binding) {
            return Err(ConfigError::Model(format!(
                "Binding {binding} is already used by <{}>",
                existing.name
            )));
        }
        self.bound.push(BoundVariable {
            name: name.to_string(),
            binding,
        });
        Ok(self)
    }

    fn check_new_name(&self, name: &str) -> Result<(), ConfigError> {
        let valid = name
            .chars()
            .next()
            .is_some_and(|c| c.is_alphabetic() || c == '_')
            && name
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '.');
        if !valid {
            return Err(ConfigError::Model(format!("Invalid variable name \"{name}\"")));
        }
        if self.kind_of(name).is_some() {
            return Err(ConfigError::Model(format!("Duplicate variable name <{name}>")));
        }
        Ok(())
    }

    pub fn states(&self) -> &[StateVariable] {
        &self.states
    }

    pub fn literals(&self) -> &[Literal] {
        &self.literals
    }

    pub fn derived(&self) -> &[Equation] {
        &self.derived
    }

    pub fn intermediates(&self) -> &[Equation] {
        &self.intermediates
    }

    pub fn bound(&self) -> &[BoundVariable] {
        &self.bound
    }

    pub fn count_states(&self) -> usize {
        self.states.len()
    }

    pub fn state_names(&self) -> Vec<String> {
        self.states.iter().map(|s| s.name.clone()).collect()
    }

    pub fn state_index(&self, name: &str) -> Option<usize> {
        self.states.iter().position(|s| s.name == name)
    }

    pub fn literal_index(&self, name: &str) -> Option<usize> {
        self.literals.iter().position(|l| l.name == name)
    }

    pub fn initial_state(&self) -> Vec<f64> {
        self.states.iter().map(|s| s.initial).collect()
    }

    pub fn kind_of(&self, name: &str) -> Option<VariableKind> {
        if self.state_index(name).is_some() {
            Some(VariableKind::State)
        } else if self.literal_index(name).is_some() {
            Some(VariableKind::Literal)
        } else if self.derived.iter().any(|d| d.name == name) {
            Some(VariableKind::Derived)
        } else if self.intermediates.iter().any(|i| i.name == name) {
            Some(VariableKind::Intermediate)
        } else if self.bound.iter().any(|b| b.name == name) {
            Some(VariableKind::Bound)
        } else {
            None
        }
    }

    /// Updates a literal's value.
    pub fn set_literal(&mut self, name: &str, value: f64) -> Result<(), ConfigError> {
        check_finite("literal value", value)?;
        if let Some(literal) = self.literals.iter_mut().find(|l| l.name == name) {
            literal.value = value;
            return Ok(());
        }
        if self.kind_of(name).is_some() {
            Err(ConfigError::NotALiteral(name.to_string()))
        } else {
            Err(ConfigError::UnknownVariable(name.to_string()))
        }
    }

    /// Name of the variable bound to `binding`, if any.
    pub fn bound_to(&self, binding: &Binding) -> Option<&str> {
        self.bound
            .iter()
            .find(|b| &b.binding == binding)
            .map(|b| b.name.as_str())
    }

    pub fn time_variable(&self) -> Option<&str> {
        self.bound_to(&Binding::Time)
    }

    /// Pacing labels referenced by bound variables, sorted.
    pub fn pace_labels(&self) -> Vec<String> {
        let labels: BTreeSet<&str> = self
            .bound
            .iter()
            .filter_map(|b| match &b.binding {
                Binding::Pace(label) => Some(label.as_str()),
                _ => None,
            })
            .collect();
        labels.into_iter().map(str::to_string).collect()
    }

    /// Checks names, references and dependency cycles.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.solved_order().map(|_| ())
    }

    /// Evaluation order of derived constants and intermediates (as indices
    /// into `derived()` and `intermediates()`), such that every variable
    /// comes after everything it depends on.
    pub fn solved_order(&self) -> Result<SolvedOrder, ConfigError> {
        for state in &self.states {
            let refs = references(&state.name, &state.rhs)?;
            self.check_references(&state.name, &refs, |_| true)?;
        }

        let mut derived_refs = Vec::with_capacity(self.derived.len());
        for eq in &self.derived {
            let refs = references(&eq.name, &eq.expression)?;
            self.check_references(&eq.name, &refs, |kind| {
                matches!(kind, VariableKind::Literal | VariableKind::Derived)
            })?;
            derived_refs.push(refs);
        }

        let mut inter_refs = Vec::with_capacity(self.intermediates.len());
        for eq in &self.intermediates {
            let refs = references(&eq.name, &eq.expression)?;
            self.check_references(&eq.name, &refs, |_| true)?;
            inter_refs.push(refs);
        }

        Ok(SolvedOrder {
            derived: topological_order(&self.derived, &derived_refs)?,
            intermediates: topological_order(&self.intermediates, &inter_refs)?,
        })
    }

    fn check_references(
        &self,
        owner: &str,
        refs: &BTreeSet<String>,
        allowed: impl Fn(VariableKind) -> bool,
    ) -> Result<(), ConfigError> {
        for name in refs {
            match self.kind_of(name) {
                None => {
                    return Err(ConfigError::Model(format!(
                        "<{owner}> references unknown variable <{name}>"
                    )))
                }
                Some(kind) if !allowed(kind) => {
                    return Err(ConfigError::Model(format!(
                        "Constant <{owner}> cannot depend on non-constant <{name}>"
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Output of [`Model::solved_order`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolvedOrder {
    pub derived: Vec<usize>,
    pub intermediates: Vec<usize>,
}

fn references(owner: &str, expression: &str) -> Result<BTreeSet<String>, ConfigError> {
    parse(expression)
        .map(|expr| expr.references())
        .map_err(|err| ConfigError::Model(format!("Unable to parse equation for <{owner}>: {err:#}")))
}

fn check_finite(what: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue { what, value })
    }
}

/// Kahn's algorithm over dependencies within one group of equations.
fn topological_order(
    equations: &[Equation],
    refs: &[BTreeSet<String>],
) -> Result<Vec<usize>, ConfigError> {
    let index: HashMap<&str, usize> = equations
        .iter()
        .enumerate()
        .map(|(i, eq)| (eq.name.as_str(), i))
        .collect();

    let mut pending: Vec<usize> = vec![0; equations.len()];
    let mut users: Vec<Vec<usize>> = vec![Vec::new(); equations.len()];
    for (i, deps) in refs.iter().enumerate() {
        for dep in deps {
            if let Some(&j) = index.get(dep.as_str()) {
                pending[i] += 1;
                users[j].push(i);
            }
        }
    }

    // Ready queue in declaration order keeps the output stable.
    let mut ready: BTreeSet<usize> = (0..equations.len()).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(equations.len());
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &user in &users[i] {
            pending[user] -= 1;
            if pending[user] == 0 {
                ready.insert(user);
            }
        }
    }

    if order.len() != equations.len() {
        let cyclic: Vec<&str> = (0..equations.len())
            .filter(|&i| pending[i] > 0)
            .map(|i| equations[i].name.as_str())
            .collect();
        return Err(ConfigError::Model(format!(
            "Cyclical dependency between {}",
            cyclic.join(", ")
        )));
    }
    Ok(order)
}

/// A quantity sensitivities are taken with respect to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Independent {
    /// A literal constant.
    Literal(String),
    /// The initial value of a state.
    InitialValue(String),
}

impl FromStr for Independent {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(inner) = s.strip_prefix("init(").and_then(|r| r.strip_suffix(')')) {
            let inner = inner.trim();
            if inner.is_empty() {
                return Err(ConfigError::Sensitivity(format!("Empty initial value reference \"{s}\"")));
            }
            return Ok(Independent::InitialValue(inner.to_string()));
        }
        if s.is_empty() {
            return Err(ConfigError::Sensitivity("Empty independent name".to_string()));
        }
        Ok(Independent::Literal(s.to_string()))
    }
}

impl fmt::Display for Independent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Independent::Literal(name) => f.write_str(name),
            Independent::InitialValue(name) => write!(f, "init({name})"),
        }
    }
}

/// Which derivatives to propagate: d(dependent)/d(independent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensitivitySpec {
    pub dependents: Vec<String>,
    pub independents: Vec<Independent>,
}

impl SensitivitySpec {
    /// Builds a spec from names; independents may be written `init(x)`.
    pub fn new<D, I>(dependents: D, independents: I) -> Result<Self, ConfigError>
    where
        D: IntoIterator,
        D::Item: Into<String>,
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let dependents = dependents.into_iter().map(Into::into).collect();
        let independents = independents
            .into_iter()
            .map(|s| s.as_ref().parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            dependents,
            independents,
        })
    }

    pub fn validate(&self, model: &Model) -> Result<(), ConfigError> {
        if self.dependents.is_empty() || self.independents.is_empty() {
            return Err(ConfigError::Sensitivity(
                "At least one dependent and one independent are required".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for dep in &self.dependents {
            match model.kind_of(dep) {
                Some(VariableKind::State | VariableKind::Intermediate) => {}
                Some(_) => {
                    return Err(ConfigError::Sensitivity(format!(
                        "Dependent <{dep}> must be a state or intermediate variable"
                    )))
                }
                None => return Err(ConfigError::UnknownVariable(dep.clone())),
            }
            if !seen.insert(dep.clone()) {
                return Err(ConfigError::Sensitivity(format!("Duplicate dependent <{dep}>")));
            }
        }
        let mut seen = BTreeSet::new();
        for indep in &self.independents {
            match indep {
                Independent::Literal(name) => match model.kind_of(name) {
                    Some(VariableKind::Literal) => {}
                    Some(_) => return Err(ConfigError::NotALiteral(name.clone())),
                    None => return Err(ConfigError::UnknownVariable(name.clone())),
                },
                Independent::InitialValue(name) => {
                    if model.state_index(name).is_none() {
                        return Err(ConfigError::NotAState(name.clone()));
                    }
                }
            }
            if !seen.insert(indep.to_string()) {
                return Err(ConfigError::Sensitivity(format!("Duplicate independent {indep}")));
            }
        }
        Ok(())
    }

    /// Literal names that act as parameters, in independent order.
    pub fn parameters(&self) -> Vec<&str> {
        self.independents
            .iter()
            .filter_map(|i| match i {
                Independent::Literal(name) => Some(name.as_str()),
                Independent::InitialValue(_) => None,
            })
            .collect()
    }

    /// Sensitivity state at time zero: row k is the unit vector of the state
    /// whose initial value is independent k, and zero for parameters.
    pub fn initial_sensitivities(&self, model: &Model) -> Vec<Vec<f64>> {
        let n = model.count_states();
        self.independents
            .iter()
            .map(|indep| {
                let mut row = vec![0.0; n];
                if let Independent::InitialValue(name) = indep {
                    if let Some(i) = model.state_index(name) {
                        row[i] = 1.0;
                    }
                }
                row
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A small excitable cell: FitzHugh-Nagumo with a paced stimulus current.
    pub(crate) fn fitzhugh_nagumo() -> Model {
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
            .expect("valid model");
        model
    }

    #[test]
    fn model_classifies_and_orders_variables() {
        let model = fitzhugh_nagumo();
        assert_eq!(model.kind_of("V"), Some(VariableKind::State));
        assert_eq!(model.kind_of("a"), Some(VariableKind::Literal));
        assert_eq!(model.kind_of("eps"), Some(VariableKind::Derived));
        assert_eq!(model.kind_of("i_stim"), Some(VariableKind::Intermediate));
        assert_eq!(model.kind_of("pace"), Some(VariableKind::Bound));
        assert_eq!(model.time_variable(), Some("t"));
        assert_eq!(model.pace_labels(), vec!["pace".to_string()]);
        assert!(model.validate().is_ok());
    }

    #[test]
    fn duplicate_and_invalid_names_are_rejected() {
        let mut model = fitzhugh_nagumo();
        assert!(matches!(model.add_literal("V", 1.0), Err(ConfigError::Model(_))));
        assert!(matches!(model.add_literal("1x", 1.0), Err(ConfigError::Model(_))));
        assert!(matches!(
            model.add_bound("t2", Binding::Time),
            Err(ConfigError::Model(_))
        ));
        assert!(matches!(
            model.add_literal("nan", f64::NAN),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn intermediates_are_sorted_by_dependency() {
        let mut model = Model::new("chain");
        model
            .add_state("x", 1.0, "c")
            .and_then(|m| m.add_intermediate("c", "b * 2"))
            .and_then(|m| m.add_intermediate("b", "a + 1"))
            .and_then(|m| m.add_intermediate("a", "x"))
            .expect("valid model");
        let order = model.solved_order().expect("acyclic");
        assert_eq!(order.intermediates, vec![2, 1, 0]);
    }

    #[test]
    fn cycles_and_bad_references_are_reported() {
        let mut model = Model::new("cyclic");
        model
            .add_state("x", 1.0, "p")
            .and_then(|m| m.add_intermediate("p", "q"))
            .and_then(|m| m.add_intermediate("q", "p"))
            .expect("names are fine");
        let err = model.validate().expect_err("cycle");
        assert!(err.to_string().contains("Cyclical dependency"));

        let mut model = Model::new("dangling");
        model.add_state("x", 1.0, "y").expect("names are fine");
        let err = model.validate().expect_err("unknown reference");
        assert!(err.to_string().contains("unknown variable <y>"));

        let mut model = Model::new("derived");
        model
            .add_state("x", 1.0, "k")
            .and_then(|m| m.add_derived("k", "x * 2"))
            .expect("names are fine");
        let err = model.validate().expect_err("constant depends on state");
        assert!(err.to_string().contains("cannot depend on non-constant"));
    }

    #[test]
    fn set_literal_distinguishes_non_literals() {
        let mut model = fitzhugh_nagumo();
        model.set_literal("a", 0.5).expect("literal");
        assert_eq!(model.literals()[0].value, 0.5);
        assert_eq!(model.set_literal("eps", 1.0), Err(ConfigError::NotALiteral("eps".into())));
        assert_eq!(model.set_literal("nope", 1.0), Err(ConfigError::UnknownVariable("nope".into())));
    }

    #[test]
    fn sensitivity_spec_parses_and_validates() {
        let model = fitzhugh_nagumo();
        let spec = SensitivitySpec::new(["V", "i_stim"], ["a", "init(V)"]).expect("parse");
        assert_eq!(spec.independents[1], Independent::InitialValue("V".into()));
        assert!(spec.validate(&model).is_ok());
        assert_eq!(spec.parameters(), vec!["a"]);
        assert_eq!(
            spec.initial_sensitivities(&model),
            vec![vec![0.0, 0.0], vec![1.0, 0.0]]
        );

        let bad = SensitivitySpec::new(["a"], ["b"]).expect("parse");
        assert!(matches!(bad.validate(&model), Err(ConfigError::Sensitivity(_))));
        let bad = SensitivitySpec::new(["V"], ["eps"]).expect("parse");
        assert_eq!(bad.validate(&model), Err(ConfigError::NotALiteral("eps".into())));
        let bad = SensitivitySpec::new(["V"], ["init(a)"]).expect("parse");
        assert_eq!(bad.validate(&model), Err(ConfigError::NotAState("a".into())));
    }
}
