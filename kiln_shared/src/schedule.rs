//! Firing schedules: ordered time/temperature control points with linear
//! interpolation between them.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScheduleError {
    #[error("schedule has no points")]
    Empty,
    #[error("schedule point {index} is not later than the point before it")]
    Unsorted { index: usize },
    #[error("schedule point {index} has a negative time")]
    NegativeTime { index: usize },
    #[error("schedule point {index} has a negative temperature")]
    NegativeTemperature { index: usize },
    #[error("schedule point {index} is not a finite number")]
    NonFinite { index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulePoint {
    /// Seconds from the start of the firing.
    pub time: f64,
    pub temperature: f64,
}

/// Validated, immutable firing schedule. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ScheduleDef", into = "ScheduleDef")]
pub struct Schedule {
    name: String,
    points: Arc<[SchedulePoint]>,
}

/// On-disk shape: `{"name": "...", "data": [[seconds, temperature], ...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScheduleDef {
    name: String,
    data: Vec<(f64, f64)>,
}

impl TryFrom<ScheduleDef> for Schedule {
    type Error = ScheduleError;

    fn try_from(def: ScheduleDef) -> Result<Self, Self::Error> {
        Schedule::from_pairs(def.name, &def.data)
    }
}

impl From<Schedule> for ScheduleDef {
    fn from(schedule: Schedule) -> Self {
        ScheduleDef {
            data: schedule.points.iter().map(|p| (p.time, p.temperature)).collect(),
            name: schedule.name,
        }
    }
}

impl Schedule {
    pub fn new(name: impl Into<String>, points: Vec<SchedulePoint>) -> Result<Self, ScheduleError> {
        if points.is_empty() {
            return Err(ScheduleError::Empty);
        }
        for (index, point) in points.iter().enumerate() {
            if !point.time.is_finite() || !point.temperature.is_finite() {
                return Err(ScheduleError::NonFinite { index });
            }
            if point.time < 0.0 {
                return Err(ScheduleError::NegativeTime { index });
            }
            if point.temperature < 0.0 {
                return Err(ScheduleError::NegativeTemperature { index });
            }
            // Equal times would make interpolation ambiguous at that instant.
            if index > 0 && point.time <= points[index - 1].time {
                return Err(ScheduleError::Unsorted { index });
            }
        }
        Ok(Self {
            name: name.into(),
            points: points.into(),
        })
    }

    pub fn from_pairs(
        name: impl Into<String>,
        pairs: &[(f64, f64)],
    ) -> Result<Self, ScheduleError> {
        let points = pairs
            .iter()
            .map(|&(time, temperature)| SchedulePoint { time, temperature })
            .collect();
        Self::new(name, points)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn points(&self) -> &[SchedulePoint] {
        &self.points
    }

    /// Time of the last control point.
    pub fn duration(&self) -> f64 {
        self.points.last().map_or(0.0, |p| p.time)
    }

    /// Scheduled temperature at virtual time `t`. Clamps to the first and
    /// last points outside the schedule's span.
    pub fn interpolate(&self, t: f64) -> f64 {
        let first = self.points[0];
        let last = self.points[self.points.len() - 1];
        // NaN compares false everywhere and lands on the first point.
        let idx = self.points.partition_point(|p| p.time <= t);
        if idx == 0 {
            return first.temperature;
        }
        if idx == self.points.len() {
            return last.temperature;
        }
        let (a, b) = (self.points[idx - 1], self.points[idx]);
        let fraction = (t - a.time) / (b.time - a.time);
        a.temperature + (b.temperature - a.temperature) * fraction
    }

    /// Earliest time `>= from` at which the schedule reaches `temperature`.
    ///
    /// Only rising or already-hot segments count: a schedule that never climbs
    /// to `temperature` after `from` returns `None`, as does a `from` at or past
    /// the end of the schedule.
    pub fn find_time_for_temperature(&self, temperature: f64, from: f64) -> Option<f64> {
        if !from.is_finite() || from >= self.duration() {
            return None;
        }
        if self.interpolate(from) >= temperature {
            return Some(from);
        }
        for pair in self.points.windows(2) {
            let (mut start, end) = (pair[0], pair[1]);
            if end.time <= from {
                continue;
            }
            if from > start.time {
                start = SchedulePoint {
                    time: from,
                    temperature: self.interpolate(from),
                };
            }
            if end.temperature < temperature {
                continue;
            }
            if start.temperature >= temperature {
                return Some(start.time);
            }
            let rise = end.temperature - start.temperature;
            if rise <= 0.0 {
                continue;
            }
            let needed = temperature - start.temperature;
            return Some(start.time + needed / rise * (end.time - start.time));
        }
        None
    }
}
