use crate::error::{SimError, SimResult};
use crate::presyn::OutputSpike;
use crate::transport::{SpikeId, WireSpike};
use crate::types::{Gid, HashMap, HashSet};

/// Largest per-rank output count for which one-byte spike ids are used.
pub const MAX_COMPRESSED_OUTPUTS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLocation {
    Local { thread: usize, output_index: u32 },
    Remote { rank: usize },
    External,
}

/// Collects this rank's output gids during loading. Output indices are handed out in
/// registration order and become the rank's output ordering.
#[derive(Debug, Clone)]
pub struct DirectoryBuilder {
    gid_space: Gid,
    compress_spikes: bool,
    local: HashMap<Gid, (usize, u32)>,
    outputs: Vec<Gid>,
    inputs: HashSet<Gid>,
}

impl DirectoryBuilder {
    pub fn new(gid_space: Gid, compress_spikes: bool) -> Self {
        Self {
            gid_space,
            compress_spikes,
            local: HashMap::default(),
            outputs: Vec::new(),
            inputs: HashSet::default(),
        }
    }

    pub fn register_output(&mut self, thread: usize, gid: Gid) -> SimResult<u32> {
        if gid < 0 {
            return Err(SimError::InvalidPopulation {
                thread,
                reason: format!("local-only gid {} cannot be an output", gid),
            });
        }
        if self.local.contains_key(&gid) {
            return Err(SimError::DuplicateGid { gid });
        }

        let output_index = self.outputs.len() as u32;
        self.local.insert(gid, (thread, output_index));
        self.outputs.push(gid);
        Ok(output_index)
    }

    /// Declares a gid fed from outside the network, e.g. by injected stimuli.
    pub fn declare_input(&mut self, gid: Gid) {
        self.inputs.insert(gid);
    }

    pub fn local_outputs(&self) -> &[Gid] {
        &self.outputs
    }

    /// Completes the directory with every rank's outputs, as gathered by the transport.
    pub fn build(self, rank: usize, rank_outputs: Vec<Vec<Gid>>) -> SimResult<SourceDirectory> {
        let mut remote: HashMap<Gid, usize> = HashMap::default();
        for (other_rank, gids) in rank_outputs.iter().enumerate() {
            if other_rank == rank {
                continue;
            }
            for gid in gids {
                if self.local.contains_key(gid) || remote.insert(*gid, other_rank).is_some() {
                    return Err(SimError::DuplicateGid { gid: *gid });
                }
            }
        }

        let compressed = self.compress_spikes
            && rank_outputs
                .iter()
                .all(|gids| gids.len() <= MAX_COMPRESSED_OUTPUTS);

        let external = self
            .inputs
            .into_iter()
            .filter(|gid| !self.local.contains_key(gid) && !remote.contains_key(gid))
            .collect();

        log::debug!(
            "rank {}: {} local outputs, {} remote, compressed spikes: {}",
            rank,
            self.outputs.len(),
            remote.len(),
            compressed
        );

        Ok(SourceDirectory {
            rank,
            num_ranks: rank_outputs.len(),
            gid_space: self.gid_space,
            compressed,
            local: self.local,
            remote,
            external,
            rank_outputs,
        })
    }
}

/// Where every spike source of the network lives. Built once during loading and shared
/// read-only afterwards.
#[derive(Debug, Clone)]
pub struct SourceDirectory {
    rank: usize,
    num_ranks: usize,
    gid_space: Gid,
    compressed: bool,
    local: HashMap<Gid, (usize, u32)>,
    remote: HashMap<Gid, usize>,
    external: HashSet<Gid>,
    rank_outputs: Vec<Vec<Gid>>,
}

impl SourceDirectory {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    pub fn gid_space(&self) -> Gid {
        self.gid_space
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn num_local_outputs(&self) -> usize {
        self.local.len()
    }

    pub fn locate(&self, gid: Gid) -> Option<SourceLocation> {
        if let Some((thread, output_index)) = self.local.get(&gid) {
            return Some(SourceLocation::Local {
                thread: *thread,
                output_index: *output_index,
            });
        }
        if let Some(rank) = self.remote.get(&gid) {
            return Some(SourceLocation::Remote { rank: *rank });
        }
        self.external
            .contains(&gid)
            .then_some(SourceLocation::External)
    }

    pub fn is_reachable(&self, gid: Gid) -> bool {
        self.locate(gid).is_some()
    }

    pub fn local_output(&self, gid: Gid) -> Option<(usize, u32)> {
        self.local.get(&gid).copied()
    }

    pub fn encode(&self, spike: &OutputSpike) -> WireSpike {
        let id = if self.compressed {
            SpikeId::Compressed(spike.localgid)
        } else {
            SpikeId::Gid(spike.gid)
        };
        WireSpike { id, t: spike.t }
    }

    pub fn decode(&self, rank: usize, spike: &WireSpike) -> SimResult<Gid> {
        let gid = match spike.id {
            SpikeId::Compressed(localgid) => self
                .rank_outputs
                .get(rank)
                .filter(|_| rank != self.rank)
                .and_then(|gids| gids.get(localgid as usize))
                .copied(),
            SpikeId::Gid(gid) => (self.remote.get(&gid) == Some(&rank)).then_some(gid),
        };

        gid.ok_or(SimError::UnknownRemoteSpike {
            rank,
            id: match spike.id {
                SpikeId::Compressed(localgid) => localgid as i64,
                SpikeId::Gid(gid) => gid as i64,
            },
        })
    }
}
