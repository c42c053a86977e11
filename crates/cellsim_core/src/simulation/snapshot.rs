use super::{Simulation, SimulationBuilder};
use crate::error::{ConfigError, Result};
use crate::kernel::SolverSettings;
use crate::model::{Model, SensitivitySpec};
use crate::protocol::PacingProtocol;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Serialized form of a [`Simulation`]: static configuration plus mutable
/// state. The kernel is not included; it is rebuilt on restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSnapshot {
    pub model: Model,
    pub protocols: BTreeMap<String, Option<PacingProtocol>>,
    pub sensitivities: Option<SensitivitySpec>,
    pub time: f64,
    pub state: Vec<f64>,
    pub default_state: Vec<f64>,
    pub sensitivity_state: Vec<Vec<f64>>,
    pub default_sensitivity_state: Vec<Vec<f64>>,
    pub settings: SolverSettings,
}

impl Simulation {
    pub fn snapshot(&self) -> SimulationSnapshot {
        SimulationSnapshot {
            model: self.model.clone(),
            protocols: self.protocol_map(),
            sensitivities: self.sensitivities.clone(),
            time: self.time,
            state: self.state.clone(),
            default_state: self.default_state.clone(),
            sensitivity_state: self.sensitivity_state.clone(),
            default_sensitivity_state: self.default_sensitivity_state.clone(),
            settings: self.settings,
        }
    }

    /// Rebuilds the kernel with the default builder, then restores state and
    /// solver settings. Settings go last: a fresh kernel starts from defaults.
    pub fn restore(snapshot: SimulationSnapshot) -> Result<Self> {
        let SimulationSnapshot {
            model,
            protocols,
            sensitivities,
            time,
            state,
            default_state,
            sensitivity_state,
            default_sensitivity_state,
            settings,
        } = snapshot;

        let mut builder = SimulationBuilder::new(model);
        for (label, protocol) in protocols {
            builder = match protocol {
                Some(protocol) => builder.protocol(label, protocol),
                None => builder.pacing_label(label),
            };
        }
        if let Some(spec) = sensitivities {
            builder = builder.sensitivities(spec);
        }
        let mut sim = builder.build()?;

        sim.set_time(time)?;
        sim.set_state(&state)?;
        sim.set_default_state(&default_state)?;
        sim.check_sensitivities(&sensitivity_state)?;
        sim.check_sensitivities(&default_sensitivity_state)?;
        sim.sensitivity_state = sensitivity_state;
        sim.default_sensitivity_state = default_sensitivity_state;
        sim.apply_settings(settings)?;
        Ok(sim)
    }

    fn check_sensitivities(&self, rows: &[Vec<f64>]) -> Result<()> {
        let independents = self
            .sensitivities
            .as_ref()
            .map_or(0, |spec| spec.independents.len());
        let n = self.model.count_states();
        if rows.len() != independents || rows.iter().any(|row| row.len() != n) {
            return Err(ConfigError::Sensitivity(format!(
                "expected a {independents} x {n} sensitivity state"
            ))
            .into());
        }
        Ok(())
    }
}

impl Serialize for Simulation {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Simulation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let snapshot = SimulationSnapshot::deserialize(deserializer)?;
        Simulation::restore(snapshot).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::fitzhugh_nagumo;
    use crate::protocol::blocktrain;
    use crate::simulation::RunOptions;

    #[test]
    fn snapshot_restores_state_and_settings() {
        let spec = SensitivitySpec::new(["V"], ["a"]).expect("spec");
        let mut sim = Simulation::builder(fitzhugh_nagumo())
            .protocol("pace", blocktrain(100.0, 2.0, 5.0, 1.0, 0).expect("protocol"))
            .pacing_label("unused")
            .sensitivities(spec)
            .build()
            .expect("simulation");
        sim.set_tolerance(1e-8, 1e-6).expect("tolerance");
        sim.set_max_step_size(2.0).expect("max step");
        sim.run(30.0, RunOptions::default(), None).expect("run");

        let snapshot = sim.snapshot();
        let restored = Simulation::restore(snapshot.clone()).expect("restore");
        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(restored.pace_labels(), sim.pace_labels());
        assert_ne!(restored.kernel_name(), sim.kernel_name());
    }

    #[test]
    fn restore_rejects_inconsistent_state() {
        let sim = Simulation::new(fitzhugh_nagumo()).expect("simulation");
        let mut snapshot = sim.snapshot();
        snapshot.sensitivity_state = vec![vec![0.0, 0.0]];
        assert!(Simulation::restore(snapshot).is_err());

        let mut snapshot = sim.snapshot();
        snapshot.state.push(1.0);
        assert!(Simulation::restore(snapshot).is_err());
    }
}
