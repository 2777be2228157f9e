use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Per-tasktype execution statistics, persisted across runs. Purely
/// advisory: the scheduler may feed predicted costs into priorities, and
/// nothing breaks when the file is absent or stale.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WisdomFile {
    pub tasktypes: HashMap<String, TasktypeStats>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TasktypeStats {
    /// Rolling mean execution cost in seconds.
    pub normalized_cost: f64,
    pub samples: u64,
    /// Rolling averages of hardware counters, keyed by counter name.
    #[serde(default)]
    pub counters: HashMap<String, f64>,
}

pub(crate) struct Wisdom {
    path: Option<PathBuf>,
    stats: Mutex<WisdomFile>,
}

impl Wisdom {
    /// Load from `path` when given; a missing file starts empty, a corrupt
    /// one is a config error.
    pub(crate) fn load(path: Option<PathBuf>) -> Result<Self> {
        let stats = match &path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading wisdom file {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing wisdom file {}", path.display()))?
            }
            _ => WisdomFile::default(),
        };
        Ok(Self {
            path,
            stats: Mutex::new(stats),
        })
    }

    pub(crate) fn record(&self, label: &str, seconds: f64) {
        let mut stats = self.stats.lock();
        let entry = stats.tasktypes.entry(label.to_owned()).or_default();
        entry.samples += 1;
        let n = entry.samples as f64;
        entry.normalized_cost += (seconds - entry.normalized_cost) / n;
    }

    pub(crate) fn predicted_cost(&self, label: &str) -> Option<f64> {
        self.stats
            .lock()
            .tasktypes
            .get(label)
            .filter(|s| s.samples > 0)
            .map(|s| s.normalized_cost)
    }

    /// Write back at shutdown. No path, no persistence.
    pub(crate) fn store(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let raw = serde_json::to_string_pretty(&*self.stats.lock())?;
        std::fs::write(path, raw)
            .with_context(|| format!("writing wisdom file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_mean_converges() {
        let wisdom = Wisdom::load(None).unwrap();
        wisdom.record("stencil", 1.0);
        wisdom.record("stencil", 3.0);
        assert_eq!(wisdom.predicted_cost("stencil"), Some(2.0));
        assert_eq!(wisdom.predicted_cost("unknown"), None);
    }

    #[test]
    fn roundtrips_through_json() {
        let dir = std::env::temp_dir().join(format!("taskweave-wisdom-{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("wisdom.json");

        let wisdom = Wisdom::load(Some(path.clone())).unwrap();
        wisdom.record("fft", 0.5);
        wisdom.store().unwrap();

        let reloaded = Wisdom::load(Some(path)).unwrap();
        assert_eq!(reloaded.predicted_cost("fft"), Some(0.5));
    }
}
