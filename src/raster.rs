use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::types::Gid;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpikeRecord {
    pub t: f64,
    pub gid: Gid,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpikeRaster {
    pub spikes: Vec<SpikeRecord>,
}

impl SpikeRaster {
    /// Merges per-thread spike logs into one raster ordered by time, then gid.
    pub fn merge(logs: impl IntoIterator<Item = Vec<SpikeRecord>>) -> Self {
        let spikes = logs
            .into_iter()
            .flatten()
            .sorted_by(|a, b| a.t.total_cmp(&b.t).then(a.gid.cmp(&b.gid)))
            .collect();

        Self { spikes }
    }

    pub fn len(&self) -> usize {
        self.spikes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spikes.is_empty()
    }

    pub fn times_of(&self, gid: Gid) -> Vec<f64> {
        self.spikes
            .iter()
            .filter(|spike| spike.gid == gid)
            .map(|spike| spike.t)
            .collect()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
