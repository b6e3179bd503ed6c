//! Per-step scalar metrics

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::TrainResult;

/// Losses reported by one joint training step
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub step: u64,
    pub gen_loss: f64,
    pub disc_loss: f64,
    pub inv_loss: f64,
    pub gradient_penalty: f64,
}

impl StepMetrics {
    pub fn is_finite(&self) -> bool {
        self.gen_loss.is_finite() && self.disc_loss.is_finite() && self.inv_loss.is_finite()
    }
}

/// Destination for step metrics
pub trait MetricsSink: Send {
    fn record(&mut self, metrics: &StepMetrics) -> TrainResult<()>;

    fn flush(&mut self) -> TrainResult<()> {
        Ok(())
    }
}

/// Appends one CSV row per step.
///
/// Reopening an existing file appends without repeating the header, so a
/// resumed run continues the same table.
pub struct CsvMetricsSink {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl CsvMetricsSink {
    pub fn open(path: &Path) -> TrainResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let needs_header = file.metadata()?.len() == 0;
        let writer = csv::WriterBuilder::new().has_headers(needs_header).from_writer(file);
        Ok(Self { path: path.to_path_buf(), writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for CsvMetricsSink {
    fn record(&mut self, metrics: &StepMetrics) -> TrainResult<()> {
        self.writer.serialize(metrics)?;
        Ok(())
    }

    fn flush(&mut self) -> TrainResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps every record in memory; clones share the same buffer
#[derive(Clone, Default)]
pub struct MemoryMetricsSink {
    records: Arc<Mutex<Vec<StepMetrics>>>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<StepMetrics> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn record(&mut self, metrics: &StepMetrics) -> TrainResult<()> {
        if let Ok(mut records) = self.records.lock() {
            records.push(*metrics);
        }
        Ok(())
    }
}

/// Discards everything
#[derive(Clone, Copy, Debug, Default)]
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn record(&mut self, _metrics: &StepMetrics) -> TrainResult<()> {
        Ok(())
    }
}
