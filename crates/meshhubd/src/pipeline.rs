//! Sensor reading ring buffers and aggregation.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SensorReading {
    pub value: f64,
    pub ts: f64,
}

/// Fixed-capacity FIFO buffer: O(1) append, evicts oldest on overflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RingBuffer {
    capacity: usize,
    readings: VecDeque<SensorReading>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), readings: VecDeque::new() }
    }

    pub fn push(&mut self, reading: SensorReading) {
        if self.readings.len() >= self.capacity {
            self.readings.pop_front();
        }
        self.readings.push_back(reading);
    }

    pub fn latest(&self) -> Option<SensorReading> {
        self.readings.back().copied()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &SensorReading> + ExactSizeIterator {
        self.readings.iter()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Min,
    Max,
    Avg,
    Sum,
    Count,
    Median,
    Stdev,
}

/// Apply one of the closed-set aggregation functions to a slice of
/// readings. `None` for `Stdev` with fewer than two samples.
pub fn aggregate_readings(readings: &[SensorReading], func: AggFunc) -> Option<f64> {
    if readings.is_empty() {
        return if func == AggFunc::Count { Some(0.0) } else { None };
    }
    let values: Vec<f64> = readings.iter().map(|r| r.value).collect();
    match func {
        AggFunc::Min => values.iter().cloned().fold(f64::INFINITY, f64::min).into(),
        AggFunc::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max).into(),
        AggFunc::Sum => Some(values.iter().sum()),
        AggFunc::Avg => Some(values.iter().sum::<f64>() / values.len() as f64),
        AggFunc::Count => Some(values.len() as f64),
        AggFunc::Median => {
            let mut sorted = values.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let mid = sorted.len() / 2;
            Some(if sorted.len() % 2 == 0 { (sorted[mid - 1] + sorted[mid]) / 2.0 } else { sorted[mid] })
        }
        AggFunc::Stdev => {
            if values.len() < 2 {
                return None;
            }
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
            Some(variance.sqrt())
        }
    }
}

#[derive(Default, Serialize, Deserialize)]
struct PersistedPipeline {
    total_recorded: u64,
    buffers: HashMap<String, Vec<SensorReading>>,
}

/// Per-(device, capability) ring buffers of recent readings, with periodic
/// disk flush.
pub struct SensorPipeline {
    path: PathBuf,
    capacity: usize,
    buffers: RwLock<HashMap<String, RingBuffer>>,
    total_recorded: RwLock<u64>,
}

impl SensorPipeline {
    pub fn load(path: impl Into<PathBuf>, capacity: usize) -> anyhow::Result<Self> {
        let path = path.into();
        let (buffers, total) = if path.exists() {
            let persisted: PersistedPipeline = serde_json::from_str(&fs::read_to_string(&path)?)?;
            let mut buffers = HashMap::new();
            for (key, readings) in persisted.buffers {
                let mut buf = RingBuffer::new(capacity);
                for reading in readings {
                    buf.push(reading);
                }
                buffers.insert(key, buf);
            }
            (buffers, persisted.total_recorded)
        } else {
            (HashMap::new(), 0)
        };

        Ok(Self { path, capacity, buffers: RwLock::new(buffers), total_recorded: RwLock::new(total) })
    }

    fn key(node_id: &str, capability: &str) -> String {
        format!("{node_id}|{capability}")
    }

    pub fn record(&self, node_id: &str, capability: &str, value: f64, ts: f64) {
        let key = Self::key(node_id, capability);
        let mut buffers = self.buffers.write().unwrap();
        buffers.entry(key).or_insert_with(|| RingBuffer::new(self.capacity)).push(SensorReading { value, ts });
        *self.total_recorded.write().unwrap() += 1;
    }

    pub fn latest(&self, node_id: &str, capability: &str) -> Option<SensorReading> {
        self.buffers.read().unwrap().get(&Self::key(node_id, capability)).and_then(|b| b.latest())
    }

    pub fn query(&self, node_id: &str, capability: &str, limit: usize) -> Vec<SensorReading> {
        self.buffers
            .read()
            .unwrap()
            .get(&Self::key(node_id, capability))
            .map(|b| b.iter().rev().take(limit).rev().copied().collect())
            .unwrap_or_default()
    }

    pub fn aggregate(&self, node_id: &str, capability: &str, func: AggFunc) -> Option<f64> {
        let buffers = self.buffers.read().unwrap();
        let buffer = buffers.get(&Self::key(node_id, capability))?;
        let readings: Vec<SensorReading> = buffer.iter().copied().collect();
        aggregate_readings(&readings, func)
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        let buffers = self.buffers.read().unwrap();
        let persisted = PersistedPipeline {
            total_recorded: *self.total_recorded.read().unwrap(),
            buffers: buffers.iter().map(|(k, v)| (k.clone(), v.iter().copied().collect())).collect(),
        };
        let body = serde_json::to_string_pretty(&persisted)?;
        let tmp = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn stats(&self) -> (u64, usize) {
        (*self.total_recorded.read().unwrap(), self.buffers.read().unwrap().len())
    }

    /// Markdown summary of the most recent reading per tracked capability,
    /// for the agent-facing context contract. `node_id` restricts the
    /// digest to that device's buffers; `None` covers every device.
    pub fn summary(&self, node_id: Option<&str>) -> String {
        let buffers = self.buffers.read().unwrap();
        let mut keys: Vec<_> = buffers
            .keys()
            .filter(|key| match node_id {
                Some(id) => key.starts_with(&format!("{id}|")),
                None => true,
            })
            .collect();
        if keys.is_empty() {
            return "No sensor readings recorded yet.".to_string();
        }
        keys.sort();
        let mut lines = vec!["## Sensor Readings".to_string()];
        for key in keys {
            if let Some(latest) = buffers[key].latest() {
                lines.push(format!("- {key}: {} (at {})", latest.value, latest.ts));
            }
        }
        lines.join("\n")
    }
}
