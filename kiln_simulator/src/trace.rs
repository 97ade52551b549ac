//! CSV trace of the broadcast stream, one row per control state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_shared::{ControlState, Outcome, SinkError, StateSink, WatchEvent};
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Serialize)]
struct TraceRow<'a> {
    started: Option<DateTime<Utc>>,
    elapsed: f64,
    runtime: f64,
    outcome: Outcome,
    profile: Option<&'a str>,
    target: f64,
    temperature: f64,
    drive: f64,
    cost: f64,
    cooldown: bool,
    fault: Option<String>,
}

impl<'a> From<&'a ControlState> for TraceRow<'a> {
    fn from(state: &'a ControlState) -> Self {
        Self {
            started: state.started_wall_clock,
            elapsed: state.elapsed,
            runtime: state.virtual_runtime,
            outcome: state.outcome,
            profile: state.profile.as_deref(),
            target: state.target_temperature,
            temperature: state.measured_temperature,
            drive: state.heater_drive,
            cost: state.accumulated_cost,
            cooldown: state.cooldown.active,
            fault: state.fault.as_ref().map(|f| format!("{:?}", f)),
        }
    }
}

pub struct CsvTraceSink<W: Write> {
    writer: csv::Writer<W>,
    rows: u64,
}

impl CsvTraceSink<File> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let writer = csv::Writer::from_path(path.as_ref())
            .map_err(|e| SinkError::Write(e.to_string()))?;
        tracing::info!("Writing firing trace to {}", path.as_ref().display());
        Ok(Self { writer, rows: 0 })
    }
}

impl<W: Write> CsvTraceSink<W> {
    pub fn from_writer(writer: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(writer),
            rows: 0,
        }
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn into_inner(self) -> Result<W, SinkError> {
        self.writer.into_inner().map_err(|e| SinkError::Write(e.to_string()))
    }

    fn write_state(&mut self, state: &ControlState) -> Result<(), SinkError> {
        self.writer
            .serialize(TraceRow::from(state))
            .map_err(|e| SinkError::Write(e.to_string()))?;
        self.rows += 1;
        Ok(())
    }
}

#[async_trait]
impl<W: Write + Send + 'static> StateSink for CsvTraceSink<W> {
    async fn push(&mut self, event: WatchEvent) -> Result<(), SinkError> {
        match event {
            WatchEvent::Backlog { log, .. } => {
                for state in &log {
                    self.write_state(state)?;
                }
            }
            WatchEvent::State(state) => self.write_state(&state)?,
            WatchEvent::Memo { .. } => return Ok(()),
        }
        self.writer.flush().map_err(|e| SinkError::Write(e.to_string()))
    }
}
