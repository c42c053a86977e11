//! Pacing protocols: map simulation time to a stimulus level for one label.
//!
//! A [`Protocol`] is a list of (possibly periodic) events, each switching the
//! level on at its start and back to zero after its duration. A
//! [`TimeSeriesProtocol`] instead interpolates sampled values. The stateful
//! [`PacingSystem`] walks an event protocol forward in time and is what
//! kernels query while stepping.

use crate::error::ProtocolError;
use crate::log::DataLog;
use serde::{Deserialize, Serialize};

/// One scheduled stimulus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolEvent {
    level: f64,
    start: f64,
    duration: f64,
    period: f64,
    multiplier: u32,
}

impl ProtocolEvent {
    /// Creates an event. A `period` of zero means the event happens once, in
    /// which case `multiplier` must be zero too; otherwise `multiplier` is
    /// the number of occurrences (zero repeats forever).
    pub fn new(
        level: f64,
        start: f64,
        duration: f64,
        period: f64,
        multiplier: u32,
    ) -> Result<Self, ProtocolError> {
        if !level.is_finite() {
            return Err(invalid(format!("level must be finite (got {level})")));
        }
        if !start.is_finite() || start < 0.0 {
            return Err(invalid(format!("start time must be non-negative (got {start})")));
        }
        if !duration.is_finite() || duration < 0.0 {
            return Err(invalid(format!("duration must be non-negative (got {duration})")));
        }
        if !period.is_finite() || period < 0.0 {
            return Err(invalid(format!("period must be non-negative (got {period})")));
        }
        if period == 0.0 && multiplier != 0 {
            return Err(invalid("a non-periodic event cannot have a multiplier".to_string()));
        }
        if period > 0.0 && duration > period {
            return Err(invalid(format!(
                "duration ({duration}) cannot exceed the period ({period})"
            )));
        }
        Ok(Self {
            level,
            start,
            duration,
            period,
            multiplier,
        })
    }

    pub fn level(&self) -> f64 {
        self.level
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn period(&self) -> f64 {
        self.period
    }

    pub fn multiplier(&self) -> u32 {
        self.multiplier
    }

    /// End of the first occurrence.
    pub fn stop(&self) -> f64 {
        self.start + self.duration
    }

    pub fn is_periodic(&self) -> bool {
        self.period > 0.0
    }

    /// True for periodic events that recur forever.
    pub fn is_infinite(&self) -> bool {
        self.is_periodic() && self.multiplier == 0
    }

    /// Start of occurrence `k` (zero-based), computed directly to avoid drift.
    fn occurrence_start(&self, k: u64) -> f64 {
        self.start + k as f64 * self.period
    }
}

fn invalid(message: String) -> ProtocolError {
    ProtocolError::InvalidEvent(message)
}

/// An ordered list of pacing events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Protocol {
    events: Vec<ProtocolEvent>,
}

impl Protocol {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Schedules a new event; see [`ProtocolEvent::new`] for the rules.
    /// Two events may not start at the same instant.
    pub fn schedule(
        &mut self,
        level: f64,
        start: f64,
        duration: f64,
        period: f64,
        multiplier: u32,
    ) -> Result<&mut Self, ProtocolError> {
        let event = ProtocolEvent::new(level, start, duration, period, multiplier)?;
        self.add(event)
    }

    /// Inserts an existing event, keeping events sorted by start time.
    pub fn add(&mut self, event: ProtocolEvent) -> Result<&mut Self, ProtocolError> {
        if self.events.iter().any(|e| e.start == event.start) {
            return Err(ProtocolError::Simultaneous { time: event.start });
        }
        let at = self.events.partition_point(|e| e.start < event.start);
        self.events.insert(at, event);
        Ok(self)
    }

    /// Appends a non-periodic event starting where the last one ends.
    pub fn add_step(&mut self, level: f64, duration: f64) -> Result<&mut Self, ProtocolError> {
        let start = match self.events.last() {
            Some(tail) if tail.is_periodic() => {
                return Err(invalid(
                    "cannot append a step after a periodic event".to_string(),
                ))
            }
            Some(tail) => tail.stop(),
            None => 0.0,
        };
        self.schedule(level, start, duration, 0.0, 0)
    }

    pub fn events(&self) -> &[ProtocolEvent] {
        &self.events
    }

    /// First event, if any.
    pub fn head(&self) -> Option<&ProtocolEvent> {
        self.events.first()
    }

    /// Last event, if any.
    pub fn tail(&self) -> Option<&ProtocolEvent> {
        self.events.last()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_infinite(&self) -> bool {
        self.events.iter().any(ProtocolEvent::is_infinite)
    }

    /// True if no event is periodic.
    pub fn is_sequence(&self) -> bool {
        self.events.iter().all(|e| !e.is_periodic())
    }

    /// True for a sequence where every event starts exactly when the
    /// previous one stops.
    pub fn is_unbroken_sequence(&self) -> bool {
        self.is_sequence()
            && self
                .events
                .windows(2)
                .all(|pair| pair[0].stop() == pair[1].start)
    }

    /// The time after which the protocol has either finished or started
    /// repeating: for a finite protocol the end of its last stimulus, for
    /// an infinitely recurring event the end of its first period.
    pub fn characteristic_time(&self) -> f64 {
        self.events
            .iter()
            .map(|e| {
                if !e.is_periodic() {
                    e.stop()
                } else if e.multiplier == 0 {
                    e.start + e.period
                } else {
                    e.occurrence_start(u64::from(e.multiplier) - 1) + e.duration
                }
            })
            .fold(0.0, f64::max)
    }

    /// Pacing levels at the given times, which must be non-negative and
    /// non-decreasing.
    pub fn value_at_times(&self, times: &[f64]) -> Result<Vec<f64>, ProtocolError> {
        check_query_times(times)?;
        let mut pacing = PacingSystem::new(self);
        times.iter().map(|&t| pacing.advance(t)).collect()
    }

    /// Level change points on `[a, b)`, as a log with `time` and `pace`
    /// columns. The level at `a` is always included.
    pub fn log_for_interval(&self, a: f64, b: f64) -> Result<DataLog, ProtocolError> {
        if !a.is_finite() || !b.is_finite() || a < 0.0 || b < a {
            return Err(ProtocolError::InvalidTimes(format!(
                "interval [{a}, {b}) must be finite, non-negative and ordered"
            )));
        }
        let mut log = DataLog::new("time");
        log.ensure_column("time");
        log.ensure_column("pace");
        let mut pacing = PacingSystem::new(self);
        let level = pacing.advance(a)?;
        log.push("time", a);
        log.push("pace", level);
        loop {
            let t = pacing.next_time();
            if t >= b {
                break;
            }
            let level = pacing.advance(t)?;
            log.push("time", t);
            log.push("pace", level);
        }
        Ok(log)
    }
}

fn check_query_times(times: &[f64]) -> Result<(), ProtocolError> {
    if let Some(t) = times.iter().find(|t| !t.is_finite() || **t < 0.0) {
        return Err(ProtocolError::InvalidTimes(format!(
            "times must be finite and non-negative (got {t})"
        )));
    }
    if let Some(pair) = times.windows(2).find(|pair| pair[1] < pair[0]) {
        return Err(ProtocolError::InvalidTimes(format!(
            "times must be non-decreasing ({} follows {})",
            pair[1], pair[0]
        )));
    }
    Ok(())
}

/// A periodic regime of identical blocks: `level` for `duration` every
/// `period`, starting at `offset`; `limit` blocks (zero for no limit).
pub fn blocktrain(
    period: f64,
    duration: f64,
    offset: f64,
    level: f64,
    limit: u32,
) -> Result<Protocol, ProtocolError> {
    let mut protocol = Protocol::new();
    protocol.schedule(level, offset, duration, period, limit)?;
    Ok(protocol)
}

/// A series of voltage-step-like pulses: for every level in `steps`, hold at
/// `hold` for `t_pre`, step for `t_step`, return to `hold` for `t_post`.
pub fn steptrain(
    steps: &[f64],
    hold: f64,
    t_pre: f64,
    t_step: f64,
    t_post: f64,
) -> Result<Protocol, ProtocolError> {
    let mut protocol = Protocol::new();
    for &level in steps {
        if t_pre > 0.0 {
            protocol.add_step(hold, t_pre)?;
        }
        protocol.add_step(level, t_step)?;
        if t_post > 0.0 {
            protocol.add_step(hold, t_post)?;
        }
    }
    Ok(protocol)
}

/// Upcoming occurrence of an event in a [`PacingSystem`] queue.
#[derive(Debug, Clone)]
struct Occurrence {
    event: usize,
    index: u64,
    start: f64,
}

/// Walks an event protocol forward in time.
#[derive(Debug, Clone)]
pub struct PacingSystem {
    events: Vec<ProtocolEvent>,
    queue: Vec<Occurrence>,
    time: f64,
    active_until: Option<f64>,
    pace: f64,
}

impl PacingSystem {
    /// A pacing system at time zero, before any event has been processed.
    pub fn new(protocol: &Protocol) -> Self {
        let queue = protocol
            .events
            .iter()
            .enumerate()
            .map(|(event, e)| Occurrence {
                event,
                index: 0,
                start: e.start,
            })
            .collect();
        Self {
            events: protocol.events.clone(),
            queue,
            time: 0.0,
            active_until: None,
            pace: 0.0,
        }
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    /// Current pacing level.
    pub fn pace(&self) -> f64 {
        self.pace
    }

    /// Time of the next level change, or infinity if there is none.
    pub fn next_time(&self) -> f64 {
        let next_start = self.queue.first().map_or(f64::INFINITY, |o| o.start);
        self.active_until.map_or(next_start, |t| t.min(next_start))
    }

    /// Moves to `new_time`, processing every change at or before it, and
    /// returns the level there.
    pub fn advance(&mut self, new_time: f64) -> Result<f64, ProtocolError> {
        if new_time < self.time {
            return Err(ProtocolError::InvalidTimes(format!(
                "cannot move pacing back in time from {} to {new_time}",
                self.time
            )));
        }
        loop {
            let next = self.next_time();
            if next > new_time {
                break;
            }
            // An event ending and another starting at the same instant:
            // the end is processed first.
            if self.active_until.is_some_and(|t| t <= next) {
                self.active_until = None;
                self.pace = 0.0;
            }
            while self.queue.first().is_some_and(|o| o.start <= next) {
                let occ = self.queue.remove(0);
                if self.queue.first().is_some_and(|o| o.start == occ.start) {
                    return Err(ProtocolError::Simultaneous { time: occ.start });
                }
                let event = &self.events[occ.event];
                self.pace = event.level;
                self.active_until = Some(occ.start + event.duration);
                if event.is_periodic()
                    && (event.multiplier == 0 || occ.index + 1 < u64::from(event.multiplier))
                {
                    let index = occ.index + 1;
                    let following = Occurrence {
                        event: occ.event,
                        index,
                        start: event.occurrence_start(index),
                    };
                    let at = self.queue.partition_point(|o| o.start < following.start);
                    self.queue.insert(at, following);
                }
            }
        }
        self.time = new_time;
        Ok(self.pace)
    }
}

/// A protocol defined by samples, linearly interpolated in between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesProtocol {
    times: Vec<f64>,
    values: Vec<f64>,
}

impl TimeSeriesProtocol {
    /// Times must be non-decreasing. A repeated time is a discontinuity:
    /// at that instant the later sample applies.
    pub fn new(times: Vec<f64>, values: Vec<f64>) -> Result<Self, ProtocolError> {
        if times.len() != values.len() {
            return Err(ProtocolError::InvalidTimeSeries(format!(
                "{} times but {} values",
                times.len(),
                values.len()
            )));
        }
        if times.is_empty() {
            return Err(ProtocolError::InvalidTimeSeries(
                "at least one sample is required".to_string(),
            ));
        }
        if times.iter().chain(&values).any(|v| !v.is_finite()) {
            return Err(ProtocolError::InvalidTimeSeries(
                "times and values must be finite".to_string(),
            ));
        }
        if times.windows(2).any(|pair| pair[1] < pair[0]) {
            return Err(ProtocolError::InvalidTimeSeries(
                "times must be non-decreasing".to_string(),
            ));
        }
        Ok(Self { times, values })
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Interpolated value at `t`; the first and last samples are held
    /// outside the sampled domain.
    pub fn pace(&self, t: f64) -> f64 {
        let above = self.times.partition_point(|&x| x <= t);
        if above == 0 {
            return self.values[0];
        }
        let lower = above - 1;
        if above == self.times.len() || self.times[lower] == t {
            return self.values[lower];
        }
        let (t0, t1) = (self.times[lower], self.times[above]);
        let (v0, v1) = (self.values[lower], self.values[above]);
        v0 + (v1 - v0) * (t - t0) / (t1 - t0)
    }

    pub fn value_at_times(&self, times: &[f64]) -> Result<Vec<f64>, ProtocolError> {
        check_query_times(times)?;
        Ok(times.iter().map(|&t| self.pace(t)).collect())
    }

    /// The last sampled time.
    pub fn characteristic_time(&self) -> f64 {
        self.times.last().copied().unwrap_or(0.0)
    }
}

/// Either kind of protocol, as bound to a pacing label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PacingProtocol {
    Events(Protocol),
    TimeSeries(TimeSeriesProtocol),
}

impl From<Protocol> for PacingProtocol {
    fn from(value: Protocol) -> Self {
        PacingProtocol::Events(value)
    }
}

impl From<TimeSeriesProtocol> for PacingProtocol {
    fn from(value: TimeSeriesProtocol) -> Self {
        PacingProtocol::TimeSeries(value)
    }
}

impl PacingProtocol {
    pub fn value_at_times(&self, times: &[f64]) -> Result<Vec<f64>, ProtocolError> {
        match self {
            PacingProtocol::Events(p) => p.value_at_times(times),
            PacingProtocol::TimeSeries(p) => p.value_at_times(times),
        }
    }

    pub fn characteristic_time(&self) -> f64 {
        match self {
            PacingProtocol::Events(p) => p.characteristic_time(),
            PacingProtocol::TimeSeries(p) => p.characteristic_time(),
        }
    }
}

/// Per-label pacing source used while stepping.
#[derive(Debug, Clone)]
pub enum Pacer {
    /// No protocol bound: the level is always zero.
    Idle,
    Events(PacingSystem),
    TimeSeries(TimeSeriesProtocol),
}

impl Pacer {
    /// A pacer positioned at `time`.
    pub fn start(protocol: Option<&PacingProtocol>, time: f64) -> Result<Self, ProtocolError> {
        Ok(match protocol {
            None => Pacer::Idle,
            Some(PacingProtocol::Events(p)) => {
                let mut system = PacingSystem::new(p);
                system.advance(time)?;
                Pacer::Events(system)
            }
            Some(PacingProtocol::TimeSeries(p)) => Pacer::TimeSeries(p.clone()),
        })
    }

    /// Level at `t`. Event levels only change through [`Pacer::advance`],
    /// so stages inside one solver step all see the same value.
    pub fn value(&self, t: f64) -> f64 {
        match self {
            Pacer::Idle => 0.0,
            Pacer::Events(system) => system.pace(),
            Pacer::TimeSeries(series) => series.pace(t),
        }
    }

    /// Next discontinuity the solver must stop at.
    pub fn next_time(&self) -> f64 {
        match self {
            Pacer::Events(system) => system.next_time(),
            Pacer::Idle | Pacer::TimeSeries(_) => f64::INFINITY,
        }
    }

    pub fn advance(&mut self, t: f64) -> Result<(), ProtocolError> {
        if let Pacer::Events(system) = self {
            system.advance(t)?;
        }
        Ok(())
    }
}
