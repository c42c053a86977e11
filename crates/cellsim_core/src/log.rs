//! Simulation logs and logging policies.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::ops::BitOr;

/// Column-oriented record of logged variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataLog {
    time_key: String,
    columns: IndexMap<String, Vec<f64>>,
}

impl DataLog {
    pub fn new(time_key: impl Into<String>) -> Self {
        Self {
            time_key: time_key.into(),
            columns: IndexMap::new(),
        }
    }

    /// Name of the column holding simulation time.
    pub fn time_key(&self) -> &str {
        &self.time_key
    }

    /// Logged time points (empty if time isn't logged).
    pub fn time(&self) -> &[f64] {
        self.get(&self.time_key).unwrap_or(&[])
    }

    pub fn get(&self, key: &str) -> Option<&[f64]> {
        self.columns.get(key).map(Vec::as_slice)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.columns.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Number of logged rows.
    pub fn len(&self) -> usize {
        self.columns.values().map(Vec::len).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds an empty column if it doesn't exist yet.
    pub fn ensure_column(&mut self, key: &str) {
        if !self.columns.contains_key(key) {
            self.columns.insert(key.to_string(), Vec::new());
        }
    }

    pub fn push(&mut self, key: &str, value: f64) {
        match self.columns.get_mut(key) {
            Some(column) => column.push(value),
            None => {
                self.columns.insert(key.to_string(), vec![value]);
            }
        }
    }

    /// Last logged time, if any.
    pub fn last_time(&self) -> Option<f64> {
        self.time().last().copied()
    }

    /// Mutable access to a column by position, used by kernels appending rows.
    pub(crate) fn column_mut(&mut self, index: usize) -> Option<&mut Vec<f64>> {
        self.columns.get_index_mut(index).map(|(_, column)| column)
    }

    pub(crate) fn column_index(&self, key: &str) -> Option<usize> {
        self.columns.get_index_of(key)
    }
}

/// Groups of variables to log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFlags(u8);

impl LogFlags {
    pub const NONE: LogFlags = LogFlags(0);
    pub const STATE: LogFlags = LogFlags(1);
    pub const BOUND: LogFlags = LogFlags(2);
    pub const INTER: LogFlags = LogFlags(4);
    pub const DERIV: LogFlags = LogFlags(8);
    pub const ALL: LogFlags = LogFlags(15);

    pub fn contains(self, other: LogFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for LogFlags {
    type Output = LogFlags;
    fn bitor(self, rhs: Self) -> Self {
        LogFlags(self.0 | rhs.0)
    }
}

/// What a run should log.
#[derive(Debug, Clone, PartialEq)]
pub enum LogSpec {
    /// Log whole groups of variables.
    Flags(LogFlags),
    /// Log the named variables; derivatives are written `dot(x)`.
    Variables(Vec<String>),
    /// Append to an existing log, keeping its columns.
    Continue(DataLog),
}

impl Default for LogSpec {
    fn default() -> Self {
        LogSpec::Flags(LogFlags::ALL)
    }
}

/// Key under which the derivative of `state` is logged.
pub fn derivative_key(state: &str) -> String {
    format!("dot({state})")
}

/// Extracts the state name from a `dot(x)` key.
pub fn parse_derivative_key(key: &str) -> Option<&str> {
    key.strip_prefix("dot(")?.strip_suffix(')')
}

/// Start times and durations of detected action potentials.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApdLog {
    pub start: Vec<f64>,
    pub duration: Vec<f64>,
}

impl ApdLog {
    /// Pairs each upward crossing with the next downward one.
    /// Leading downward and trailing upward crossings are dropped.
    pub fn from_crossings(crossings: &[(f64, i8)]) -> Self {
        let mut log = ApdLog::default();
        let mut pending_start = None;
        for &(time, direction) in crossings {
            if direction > 0 {
                pending_start = Some(time);
            } else if let Some(start) = pending_start.take() {
                log.start.push(start);
                log.duration.push(time - start);
            }
        }
        log
    }

    pub fn len(&self) -> usize {
        self.start.len()
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine_and_contain() {
        let flags = LogFlags::STATE | LogFlags::DERIV;
        assert!(flags.contains(LogFlags::STATE));
        assert!(flags.contains(LogFlags::DERIV));
        assert!(!flags.contains(LogFlags::BOUND));
        assert!(LogFlags::ALL.contains(flags));
        assert!(LogFlags::NONE.is_empty());
    }

    #[test]
    fn data_log_tracks_columns_and_time() {
        let mut log = DataLog::new("engine.time");
        assert!(log.is_empty());
        assert_eq!(log.last_time(), None);
        log.push("engine.time", 0.0);
        log.push("V", -80.0);
        log.push("engine.time", 1.0);
        log.push("V", -79.0);
        assert_eq!(log.len(), 2);
        assert_eq!(log.time(), &[0.0, 1.0]);
        assert_eq!(log.last_time(), Some(1.0));
        assert_eq!(log.keys().collect::<Vec<_>>(), vec!["engine.time", "V"]);
    }

    #[test]
    fn derivative_keys_round_trip() {
        assert_eq!(derivative_key("V"), "dot(V)");
        assert_eq!(parse_derivative_key("dot(m.h)"), Some("m.h"));
        assert_eq!(parse_derivative_key("V"), None);
    }

    #[test]
    fn apd_pairs_up_and_down_crossings() {
        let crossings = [(1.0, -1), (10.0, 1), (250.0, -1), (1010.0, 1), (1240.0, -1), (2010.0, 1)];
        let apds = ApdLog::from_crossings(&crossings);
        assert_eq!(apds.start, vec![10.0, 1010.0]);
        assert_eq!(apds.duration, vec![240.0, 230.0]);
    }
}
