//! Kernel source text.
//!
//! Kernel sources are line-oriented: one declaration per line, `#` starts a
//! comment. The first line names the module through the `{{module_name}}`
//! placeholder, which the builder fills in with a process-unique name:
//!
//! ```text
//! kernel {{module_name}}
//! model fhn
//! label pace
//! state V = -1.2 : V - V^3 / 3 - w + i_stim
//! literal a = 0.7
//! derived eps = 0.08 * b / 0.8
//! inter i_stim = amplitude * pace
//! bind t = time
//! bind pace = pace(pace)
//! dependent V
//! independent init(V)
//! ```

use crate::error::ConfigError;
use crate::model::{Binding, Model, SensitivitySpec};
use anyhow::{anyhow, bail, Context, Result};
use std::collections::BTreeMap;
use std::fmt::Write;

/// Placeholder replaced by the unique module name at build time.
pub const MODULE_NAME_KEY: &str = "module_name";

/// A parsed kernel source.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelSource {
    pub module: String,
    pub model: Model,
    pub labels: Vec<String>,
    pub sensitivities: Option<SensitivitySpec>,
}

/// Writes the kernel source template for a model, the pacing labels it will
/// be driven with and an optional sensitivity specification.
pub fn write_kernel_source(model: &Model, labels: &[String], spec: Option<&SensitivitySpec>) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = write_source(&mut out, model, labels, spec);
    out
}

fn write_source(
    out: &mut String,
    model: &Model,
    labels: &[String],
    spec: Option<&SensitivitySpec>,
) -> std::fmt::Result {
    writeln!(out, "kernel {{{{{MODULE_NAME_KEY}}}}}")?;
    writeln!(out, "model {}", model.name())?;
    for label in labels {
        writeln!(out, "label {label}")?;
    }
    for state in model.states() {
        writeln!(out, "state {} = {} : {}", state.name, state.initial, state.rhs)?;
    }
    for literal in model.literals() {
        writeln!(out, "literal {} = {}", literal.name, literal.value)?;
    }
    for eq in model.derived() {
        writeln!(out, "derived {} = {}", eq.name, eq.expression)?;
    }
    for eq in model.intermediates() {
        writeln!(out, "inter {} = {}", eq.name, eq.expression)?;
    }
    for bound in model.bound() {
        let binding = match &bound.binding {
            Binding::Time => "time".to_string(),
            Binding::Pace(label) => format!("pace({label})"),
            Binding::Evaluations => "evaluations".to_string(),
            Binding::Realtime => "realtime".to_string(),
        };
        writeln!(out, "bind {} = {binding}", bound.name)?;
    }
    if let Some(spec) = spec {
        for dep in &spec.dependents {
            writeln!(out, "dependent {dep}")?;
        }
        for indep in &spec.independents {
            writeln!(out, "independent {indep}")?;
        }
    }
    Ok(())
}

/// Substitutes every `{{key}}` in `template`. Unknown keys are an error.
pub fn render(template: &str, vars: &BTreeMap<String, String>) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| ConfigError::Template("unterminated placeholder".to_string()))?;
        let key = after[..close].trim();
        let value = vars
            .get(key)
            .ok_or_else(|| ConfigError::Template(format!("no value for placeholder \"{key}\"")))?;
        out.push_str(value);
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Parses a rendered kernel source.
pub fn read_kernel_source(text: &str) -> Result<KernelSource> {
    let mut module = None;
    let mut model = Model::new("");
    let mut labels = Vec::new();
    let mut dependents = Vec::new();
    let mut independents = Vec::new();

    for (number, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        read_line(line, &mut module, &mut model, &mut labels, &mut dependents, &mut independents)
            .with_context(|| format!("line {}: {line}", number + 1))?;
    }

    let module = module.ok_or_else(|| anyhow!("missing kernel declaration"))?;
    let sensitivities = if dependents.is_empty() && independents.is_empty() {
        None
    } else {
        Some(SensitivitySpec::new(dependents, independents)?)
    };
    Ok(KernelSource {
        module,
        model,
        labels,
        sensitivities,
    })
}

fn read_line(
    line: &str,
    module: &mut Option<String>,
    model: &mut Model,
    labels: &mut Vec<String>,
    dependents: &mut Vec<String>,
    independents: &mut Vec<String>,
) -> Result<()> {
    let (keyword, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    match keyword {
        "kernel" => {
            if module.is_some() {
                bail!("duplicate kernel declaration");
            }
            if rest.contains("{{") {
                bail!("unrendered module name {rest}");
            }
            *module = Some(word(rest)?.to_string());
        }
        "model" => {
            if !model.name().is_empty() {
                bail!("duplicate model declaration");
            }
            let mut renamed = Model::new(word(rest)?);
            std::mem::swap(model, &mut renamed);
            if renamed != Model::new("") {
                bail!("model declaration must come before variables");
            }
        }
        "label" => labels.push(word(rest)?.to_string()),
        "state" => {
            let (name, rest) = assignment(rest)?;
            let (initial, rhs) = rest
                .split_once(':')
                .ok_or_else(|| anyhow!("expected \"<initial value> : <expression>\""))?;
            let initial: f64 = initial
                .trim()
                .parse()
                .with_context(|| format!("invalid initial value \"{}\"", initial.trim()))?;
            model.add_state(name, initial, rhs.trim())?;
        }
        "literal" => {
            let (name, value) = assignment(rest)?;
            let value: f64 = value
                .parse()
                .with_context(|| format!("invalid literal value \"{value}\""))?;
            model.add_literal(name, value)?;
        }
        "derived" => {
            let (name, expression) = assignment(rest)?;
            model.add_derived(name, expression)?;
        }
        "inter" => {
            let (name, expression) = assignment(rest)?;
            model.add_intermediate(name, expression)?;
        }
        "bind" => {
            let (name, binding) = assignment(rest)?;
            model.add_bound(name, parse_binding(binding)?)?;
        }
        "dependent" => dependents.push(word(rest)?.to_string()),
        "independent" => independents.push(rest.to_string()),
        "include" => bail!("unresolved include {rest}"),
        other => bail!("unknown declaration \"{other}\""),
    }
    Ok(())
}

fn word(text: &str) -> Result<&str> {
    match text.split_whitespace().collect::<Vec<_>>().as_slice() {
        [single] => Ok(single),
        _ => Err(anyhow!("expected a single name, got \"{text}\"")),
    }
}

fn assignment(text: &str) -> Result<(&str, &str)> {
    let (name, value) = text
        .split_once('=')
        .ok_or_else(|| anyhow!("expected \"<name> = <value>\""))?;
    Ok((word(name)?, value.trim()))
}

fn parse_binding(text: &str) -> Result<Binding> {
    Ok(match text {
        "time" => Binding::Time,
        "evaluations" => Binding::Evaluations,
        "realtime" => Binding::Realtime,
        _ => {
            let label = text
                .strip_prefix("pace(")
                .and_then(|r| r.strip_suffix(')'))
                .ok_or_else(|| anyhow!("unknown binding \"{text}\""))?;
            Binding::Pace(word(label)?.to_string())
        }
    })
}
