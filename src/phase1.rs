use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::condition::ConditionEvent;
use crate::directory::SourceDirectory;
use crate::error::{SimError, SimResult};
use crate::netcon::{NetCon, SourceRef};
use crate::presyn::{InputPreSyn, PreSyn};
use crate::routing::{build_listener_table, Routing};
use crate::types::{Gid, HashMap, TargetId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreSynRecord {
    pub threshold: f64,
    #[serde(default)]
    pub thvar: Option<usize>,
    #[serde(default)]
    pub pntsrc: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetConRecord {
    pub target: Option<usize>,
    pub delay: f64,
    pub weights: Vec<f64>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Connection declared outside the thread's own connection list, typically stitching threads
/// or replicas together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraConRecord {
    pub srcgid: Gid,
    pub target: Option<usize>,
    pub delay: f64,
    pub weights: Vec<f64>,
}

/// Everything one thread needs to build its routing tables. `output_gids[i]` is the gid of
/// `presyns[i]`, and `netcon_srcgids[i]` the source gid of `netcons[i]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadPopulation {
    pub output_gids: Vec<Gid>,
    pub presyns: Vec<PreSynRecord>,
    pub netcon_srcgids: Vec<Gid>,
    pub netcons: Vec<NetConRecord>,
    #[serde(default)]
    pub input_gids: Vec<Gid>,
    #[serde(default)]
    pub extracons: Vec<ExtraConRecord>,
}

/// In-memory population source, for models handed over by a host program.
pub trait DirectSource {
    fn output_gids(&self, thread: usize) -> Vec<Gid>;

    fn presyns(&self, thread: usize) -> Vec<PreSynRecord>;

    /// Connections with their source gids.
    fn netcons(&self, thread: usize) -> Vec<(Gid, NetConRecord)>;

    fn input_gids(&self, _thread: usize) -> Vec<Gid> {
        Vec::new()
    }

    fn extracons(&self, _thread: usize) -> Vec<ExtraConRecord> {
        Vec::new()
    }
}

impl DirectSource for [ThreadPopulation] {
    fn output_gids(&self, thread: usize) -> Vec<Gid> {
        self.get(thread)
            .map(|population| population.output_gids.clone())
            .unwrap_or_default()
    }

    fn presyns(&self, thread: usize) -> Vec<PreSynRecord> {
        self.get(thread)
            .map(|population| population.presyns.clone())
            .unwrap_or_default()
    }

    fn netcons(&self, thread: usize) -> Vec<(Gid, NetConRecord)> {
        self.get(thread)
            .map(|population| {
                population
                    .netcon_srcgids
                    .iter()
                    .copied()
                    .zip(population.netcons.iter().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn input_gids(&self, thread: usize) -> Vec<Gid> {
        self.get(thread)
            .map(|population| population.input_gids.clone())
            .unwrap_or_default()
    }

    fn extracons(&self, thread: usize) -> Vec<ExtraConRecord> {
        self.get(thread)
            .map(|population| population.extracons.clone())
            .unwrap_or_default()
    }
}

/// A connection whose source is still a gid. `srcgid` is `None` for unconnected placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNetCon {
    pub srcgid: Option<Gid>,
    pub target: Option<usize>,
    pub delay: f64,
    pub weights: Vec<f64>,
    pub active: bool,
}

/// Loader state of one thread, consumed by `populate`.
#[derive(Debug, Clone)]
pub struct Phase1 {
    thread: usize,
    output_gids: Vec<Gid>,
    presyns: Vec<PreSynRecord>,
    netcons: Vec<RawNetCon>,
    input_gids: Vec<Gid>,
    num_base_netcons: usize,
    shifted_for: Option<usize>,
}

impl Phase1 {
    pub fn from_population(thread: usize, population: ThreadPopulation) -> SimResult<Self> {
        let invalid = |reason: String| SimError::InvalidPopulation { thread, reason };

        if population.output_gids.len() != population.presyns.len() {
            return Err(invalid(format!(
                "{} output gids for {} sources",
                population.output_gids.len(),
                population.presyns.len()
            )));
        }
        if population.netcon_srcgids.len() != population.netcons.len() {
            return Err(invalid(format!(
                "{} source gids for {} connections",
                population.netcon_srcgids.len(),
                population.netcons.len()
            )));
        }

        let mut netcons: Vec<RawNetCon> = population
            .netcon_srcgids
            .into_iter()
            .zip(population.netcons)
            .map(|(srcgid, record)| RawNetCon {
                srcgid: Some(srcgid),
                target: record.target,
                delay: record.delay,
                weights: record.weights,
                active: record.active,
            })
            .collect();
        let num_base_netcons = netcons.len();

        netcons.extend(population.extracons.into_iter().map(|record| RawNetCon {
            srcgid: Some(record.srcgid),
            target: record.target,
            delay: record.delay,
            weights: record.weights,
            active: true,
        }));

        for netcon in &netcons {
            if !(netcon.delay >= 0.0) {
                return Err(invalid(format!("connection delay {}", netcon.delay)));
            }
        }

        Ok(Self {
            thread,
            output_gids: population.output_gids,
            presyns: population.presyns,
            netcons,
            input_gids: population.input_gids,
            num_base_netcons,
            shifted_for: None,
        })
    }

    /// Reads the JSON encoding of a `ThreadPopulation`.
    pub fn read_file<R: Read>(thread: usize, reader: R) -> SimResult<Self> {
        let population: ThreadPopulation = serde_json::from_reader(reader)?;
        Self::from_population(thread, population)
    }

    pub fn read_direct<S: DirectSource + ?Sized>(thread: usize, source: &S) -> SimResult<Self> {
        let (netcon_srcgids, netcons) = source.netcons(thread).into_iter().unzip();

        Self::from_population(
            thread,
            ThreadPopulation {
                output_gids: source.output_gids(thread),
                presyns: source.presyns(thread),
                netcon_srcgids,
                netcons,
                input_gids: source.input_gids(thread),
                extracons: source.extracons(thread),
            },
        )
    }

    pub fn thread(&self) -> usize {
        self.thread
    }

    pub fn output_gids(&self) -> &[Gid] {
        &self.output_gids
    }

    pub fn input_gids(&self) -> &[Gid] {
        &self.input_gids
    }

    pub fn netcons(&self) -> &[RawNetCon] {
        &self.netcons
    }

    pub fn shifted_for(&self) -> Option<usize> {
        self.shifted_for
    }

    /// Moves every non-negative gid into replica `imult`'s block of `gid_space` gids. Repeating
    /// the call for the same replica is a no-op.
    pub fn shift_gids(&mut self, imult: usize, gid_space: Gid) -> SimResult<()> {
        match self.shifted_for {
            Some(done) if done == imult => return Ok(()),
            Some(done) => {
                return Err(SimError::InvalidPopulation {
                    thread: self.thread,
                    reason: format!("gids already shifted for replica {}", done),
                })
            }
            None => {}
        }

        let offset = (imult as i64) * (gid_space as i64);
        let shift = |gid: Gid| -> SimResult<Gid> {
            if gid < 0 {
                return Ok(gid);
            }
            if gid >= gid_space {
                return Err(SimError::GidOutOfRange { gid, gid_space });
            }
            Gid::try_from(offset + gid as i64).map_err(|_| SimError::GidOutOfRange { gid, gid_space })
        };

        // validate everything before touching anything
        let output_gids = self
            .output_gids
            .iter()
            .map(|gid| shift(*gid))
            .collect::<SimResult<Vec<_>>>()?;
        let input_gids = self
            .input_gids
            .iter()
            .map(|gid| shift(*gid))
            .collect::<SimResult<Vec<_>>>()?;
        let srcgids = self
            .netcons
            .iter()
            .map(|netcon| netcon.srcgid.map(shift).transpose())
            .collect::<SimResult<Vec<_>>>()?;

        self.output_gids = output_gids;
        self.input_gids = input_gids;
        for (netcon, srcgid) in self.netcons.iter_mut().zip(srcgids) {
            netcon.srcgid = srcgid;
        }
        self.shifted_for = Some(imult);

        Ok(())
    }

    /// Appends `count` synthetic connections that borrow sources from the neighbouring replica,
    /// cycling through the base connections with a non-negative source. Replica 0 borrows from
    /// the last replica. Gids must already be shifted.
    pub fn add_extracon(&mut self, count: usize, num_replicas: usize, gid_space: Gid) -> SimResult<()> {
        let imult = self.shifted_for.ok_or(SimError::InvalidPopulation {
            thread: self.thread,
            reason: "extra connections need shifted gids".to_string(),
        })?;

        let sidoffset = if imult > 0 {
            -(gid_space as i64)
        } else if num_replicas > 1 {
            (num_replicas as i64 - 1) * gid_space as i64
        } else {
            0
        };

        let candidates: Vec<usize> = self.netcons[..self.num_base_netcons]
            .iter()
            .enumerate()
            .filter(|(_, netcon)| netcon.srcgid.map_or(false, |gid| gid >= 0))
            .map(|(idx, _)| idx)
            .collect();

        for i in 0..count {
            let extra = match candidates.get(i % candidates.len().max(1)) {
                Some(base_idx) => {
                    let base = &self.netcons[*base_idx];
                    let srcgid = base.srcgid.map(|gid| gid as i64 + sidoffset).unwrap_or(-1);
                    RawNetCon {
                        srcgid: Some(Gid::try_from(srcgid).map_err(|_| {
                            SimError::GidOutOfRange {
                                gid: base.srcgid.unwrap_or(-1),
                                gid_space,
                            }
                        })?),
                        target: base.target,
                        delay: base.delay,
                        weights: base.weights.clone(),
                        active: true,
                    }
                }
                None => RawNetCon {
                    srcgid: None,
                    target: None,
                    delay: 0.0,
                    weights: Vec::new(),
                    active: false,
                },
            };
            self.netcons.push(extra);
        }

        log::debug!(
            "replica {}: added {} extra connections with source offset {}",
            imult,
            count,
            sidoffset
        );

        Ok(())
    }

    /// Resolves every source gid and builds the thread's routing tables. Same-thread sources
    /// become local sources, anything else the directory knows becomes an input source.
    pub fn populate(
        mut self,
        thread: usize,
        imult: usize,
        directory: &SourceDirectory,
    ) -> SimResult<Routing> {
        self.shift_gids(imult, directory.gid_space())?;

        let mut gid2presyn: HashMap<Gid, usize> = HashMap::default();
        let mut presyns = Vec::with_capacity(self.presyns.len());
        let mut pnt2presyn = HashMap::default();

        for (idx, (gid, record)) in self.output_gids.iter().zip(&self.presyns).enumerate() {
            if gid2presyn.insert(*gid, idx).is_some() {
                return Err(SimError::DuplicateGid { gid: *gid });
            }

            let output_index = if *gid >= 0 {
                match directory.local_output(*gid) {
                    Some((owner, output_index)) if owner == thread => Some(output_index),
                    _ => {
                        return Err(SimError::InvalidPopulation {
                            thread,
                            reason: format!("output gid {} is not registered on this thread", gid),
                        })
                    }
                }
            } else {
                None
            };

            let pntsrc = record.pntsrc.map(|index| TargetId::new(thread, index));
            if let Some(target) = pntsrc {
                pnt2presyn.insert(target, idx);
            }

            presyns.push(PreSyn {
                gid: *gid,
                threshold: record.threshold,
                thvar: record.thvar,
                pntsrc,
                nc_index: 0,
                nc_cnt: 0,
                localgid: match output_index {
                    Some(output_index) if directory.is_compressed() => output_index as u8,
                    _ => 0,
                },
                output_index,
                condition: ConditionEvent::new(),
            });
        }

        let mut input_presyns: Vec<InputPreSyn> = Vec::new();
        let mut gid2in: HashMap<Gid, usize> = HashMap::default();
        let mut input_for = |gid: Gid, input_presyns: &mut Vec<InputPreSyn>| {
            *gid2in.entry(gid).or_insert_with(|| {
                input_presyns.push(InputPreSyn {
                    gid,
                    nc_index: 0,
                    nc_cnt: 0,
                });
                input_presyns.len() - 1
            })
        };

        for gid in &self.input_gids {
            if !gid2presyn.contains_key(gid) {
                input_for(*gid, &mut input_presyns);
            }
        }

        let mut netcons = Vec::with_capacity(self.netcons.len());
        let mut weights = Vec::new();
        for raw in self.netcons {
            let source = match raw.srcgid {
                None => None,
                Some(gid) => match gid2presyn.get(&gid) {
                    Some(idx) => Some(SourceRef::PreSyn(*idx)),
                    None if gid >= 0 && directory.is_reachable(gid) => {
                        Some(SourceRef::InputPreSyn(input_for(gid, &mut input_presyns)))
                    }
                    None => return Err(SimError::UnresolvedSource { thread, gid }),
                },
            };

            netcons.push(NetCon {
                active: raw.active,
                delay: raw.delay,
                target: raw.target.map(|index| TargetId::new(thread, index)),
                source,
                weight_index: weights.len(),
                weight_cnt: raw.weights.len(),
            });
            weights.extend(raw.weights);
        }

        let (netcon_in_presyn_order, ranges) =
            build_listener_table(presyns.len(), input_presyns.len(), &netcons);
        let (local_ranges, input_ranges) = ranges.split_at(presyns.len());
        for (presyn, (nc_index, nc_cnt)) in presyns.iter_mut().zip(local_ranges) {
            presyn.nc_index = *nc_index;
            presyn.nc_cnt = *nc_cnt;
        }
        for (input_presyn, (nc_index, nc_cnt)) in input_presyns.iter_mut().zip(input_ranges) {
            input_presyn.nc_index = *nc_index;
            input_presyn.nc_cnt = *nc_cnt;
        }

        log::debug!(
            "thread {}: {} sources, {} input sources, {} connections, {} weights",
            thread,
            presyns.len(),
            input_presyns.len(),
            netcons.len(),
            weights.len()
        );

        Ok(Routing {
            thread,
            presyns,
            input_presyns,
            netcons,
            netcon_in_presyn_order,
            weights,
            gid2in,
            pnt2presyn,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::DirectoryBuilder;
    use itertools::assert_equal;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn presyn_record() -> PreSynRecord {
        PreSynRecord {
            threshold: 10.0,
            thvar: Some(0),
            pntsrc: None,
        }
    }

    fn netcon_record(target: usize, delay: f64, weight: f64) -> NetConRecord {
        NetConRecord {
            target: Some(target),
            delay,
            weights: vec![weight],
            active: true,
        }
    }

    fn directory_for(phase1s: &[&Phase1], remote: Vec<Gid>, gid_space: Gid) -> SourceDirectory {
        let mut builder = DirectoryBuilder::new(gid_space, false);
        for (thread, phase1) in phase1s.iter().enumerate() {
            for gid in phase1.output_gids().iter().filter(|gid| **gid >= 0) {
                builder.register_output(thread, *gid).unwrap();
            }
            for gid in phase1.input_gids() {
                builder.declare_input(*gid);
            }
        }
        let local = builder.local_outputs().to_vec();
        builder.build(0, vec![local, remote]).unwrap()
    }

    fn population() -> ThreadPopulation {
        ThreadPopulation {
            output_gids: vec![100, -1],
            presyns: vec![presyn_record(), presyn_record()],
            netcon_srcgids: vec![100, -1, 7, 100, 500],
            netcons: vec![
                netcon_record(0, 1.0, 0.1),
                netcon_record(0, 2.0, 0.2),
                netcon_record(1, 0.5, 0.3),
                netcon_record(1, 1.5, 0.4),
                netcon_record(1, 3.0, 0.5),
            ],
            input_gids: vec![900],
            extracons: Vec::new(),
        }
    }

    #[test]
    fn populate_resolves_sources() {
        let phase1 = Phase1::from_population(0, population()).unwrap();
        let directory = directory_for(&[&phase1], vec![7, 500], 1000);

        let routing = phase1.populate(0, 0, &directory).unwrap();

        assert_eq!(routing.presyns().len(), 2);
        assert_equal(routing.input_gids(), [900, 7, 500]);
        assert_equal(
            routing.listeners(SourceRef::PreSyn(0)).iter().copied(),
            [0, 3],
        );
        assert_equal(
            routing.listeners(SourceRef::PreSyn(1)).iter().copied(),
            [1],
        );
        assert!(routing.listeners(SourceRef::InputPreSyn(0)).is_empty());
        assert_equal(
            routing.listeners(SourceRef::InputPreSyn(1)).iter().copied(),
            [2],
        );
        assert_eq!(routing.presyns()[0].output_index(), Some(0));
        assert_eq!(routing.presyns()[1].output_index(), None);
    }

    #[test]
    fn every_netcon_in_weight_state() {
        let phase1 = Phase1::from_population(0, population()).unwrap();
        let directory = directory_for(&[&phase1], vec![7, 500], 1000);
        let routing = phase1.populate(0, 0, &directory).unwrap();

        let mut covered = 0;
        for (netcon_id, netcon) in routing.netcons().iter().enumerate() {
            assert_eq!(netcon.weight_range().start, covered);
            covered = netcon.weight_range().end;
            assert_eq!(routing.netcon_weights(netcon_id).len(), 1);
        }
        assert_eq!(covered, 5);
        assert_eq!(routing.netcon_weights(4), [0.5]);
    }

    #[test]
    fn unresolved_source() {
        let phase1 = Phase1::from_population(0, population()).unwrap();
        let directory = directory_for(&[&phase1], vec![7], 1000);

        assert!(matches!(
            phase1.populate(0, 0, &directory),
            Err(SimError::UnresolvedSource { thread: 0, gid: 500 })
        ));
    }

    #[test]
    fn local_only_gid_not_visible_to_other_threads() {
        let owner = Phase1::from_population(0, population()).unwrap();
        let other = Phase1::from_population(
            1,
            ThreadPopulation {
                netcon_srcgids: vec![-1],
                netcons: vec![netcon_record(0, 1.0, 1.0)],
                ..ThreadPopulation::default()
            },
        )
        .unwrap();
        let directory = directory_for(&[&owner, &other], vec![7, 500], 1000);

        assert!(matches!(
            other.populate(1, 0, &directory),
            Err(SimError::UnresolvedSource { thread: 1, gid: -1 })
        ));
    }

    #[test]
    fn replica_shift() {
        let mut sut = Phase1::from_population(
            0,
            ThreadPopulation {
                output_gids: vec![42, -3],
                presyns: vec![presyn_record(), presyn_record()],
                netcon_srcgids: vec![42, -3],
                netcons: vec![netcon_record(0, 1.0, 1.0), netcon_record(0, 1.0, 1.0)],
                input_gids: vec![9],
                extracons: Vec::new(),
            },
        )
        .unwrap();

        sut.shift_gids(1, 10_000).unwrap();
        assert_eq!(sut.output_gids(), [10_042, -3]);
        assert_eq!(sut.input_gids(), [10_009]);
        assert_equal(
            sut.netcons().iter().map(|netcon| netcon.srcgid),
            [Some(10_042), Some(-3)],
        );

        // idempotent for the same replica, refused for another
        sut.shift_gids(1, 10_000).unwrap();
        assert_eq!(sut.output_gids()[0], 10_042);
        assert!(sut.shift_gids(2, 10_000).is_err());
    }

    #[test]
    fn shift_rejects_gid_outside_space() {
        let mut sut = Phase1::from_population(
            0,
            ThreadPopulation {
                output_gids: vec![10_000],
                presyns: vec![presyn_record()],
                ..ThreadPopulation::default()
            },
        )
        .unwrap();

        assert!(matches!(
            sut.shift_gids(1, 10_000),
            Err(SimError::GidOutOfRange {
                gid: 10_000,
                gid_space: 10_000
            })
        ));
        assert_eq!(sut.output_gids(), [10_000]);
    }

    #[test]
    fn shift_is_injective() {
        let mut rng = StdRng::seed_from_u64(0);
        let gid_space = 5_000;
        let mut seen = std::collections::HashSet::new();

        for imult in 0..4 {
            let mut gids: Vec<Gid> = (0..200).map(|_| rng.gen_range(0..gid_space)).collect();
            gids.sort_unstable();
            gids.dedup();

            let mut sut = Phase1::from_population(
                0,
                ThreadPopulation {
                    presyns: vec![presyn_record(); gids.len()],
                    output_gids: gids,
                    ..ThreadPopulation::default()
                },
            )
            .unwrap();
            sut.shift_gids(imult, gid_space).unwrap();

            for gid in sut.output_gids() {
                assert!(seen.insert(*gid), "gid {} produced twice", gid);
                assert_eq!(*gid as usize / gid_space as usize, imult);
            }
        }
    }

    #[test]
    fn extracon_ring() {
        let base = ThreadPopulation {
            output_gids: vec![3],
            presyns: vec![presyn_record()],
            netcon_srcgids: vec![-1, 3, 8],
            netcons: vec![
                netcon_record(0, 0.1, 0.0),
                netcon_record(0, 1.0, 0.5),
                netcon_record(0, 2.0, 0.7),
            ],
            ..ThreadPopulation::default()
        };

        let mut replica_0 = Phase1::from_population(0, base.clone()).unwrap();
        replica_0.shift_gids(0, 100).unwrap();
        replica_0.add_extracon(3, 3, 100).unwrap();
        assert_equal(
            replica_0.netcons()[3..].iter().map(|netcon| netcon.srcgid),
            [Some(203), Some(208), Some(203)],
        );
        assert_eq!(replica_0.netcons()[4].weights, [0.7]);

        let mut replica_2 = Phase1::from_population(2, base).unwrap();
        replica_2.shift_gids(2, 100).unwrap();
        replica_2.add_extracon(2, 3, 100).unwrap();
        assert_equal(
            replica_2.netcons()[3..].iter().map(|netcon| netcon.srcgid),
            [Some(103), Some(108)],
        );
    }

    #[test]
    fn extracon_without_candidates_is_placeholder() {
        let mut sut = Phase1::from_population(
            0,
            ThreadPopulation {
                output_gids: vec![-1],
                presyns: vec![presyn_record()],
                netcon_srcgids: vec![-1],
                netcons: vec![netcon_record(0, 1.0, 1.0)],
                ..ThreadPopulation::default()
            },
        )
        .unwrap();
        sut.shift_gids(0, 100).unwrap();
        sut.add_extracon(2, 1, 100).unwrap();

        let directory = DirectoryBuilder::new(100, false).build(0, vec![vec![]]).unwrap();
        let routing = sut.populate(0, 0, &directory).unwrap();

        assert_eq!(routing.netcons().len(), 3);
        assert!(routing.netcons()[1..]
            .iter()
            .all(|netcon| netcon.source().is_none() && !netcon.is_active()));
    }

    #[test]
    fn read_file_json() {
        let json = r#"{
            "output_gids": [1],
            "presyns": [{"threshold": 0.0, "thvar": 0}],
            "netcon_srcgids": [1],
            "netcons": [{"target": 0, "delay": 1.0, "weights": [0.5]}]
        }"#;

        let sut = Phase1::read_file(0, json.as_bytes()).unwrap();
        assert_eq!(sut.output_gids(), [1]);
        assert!(sut.netcons()[0].active);

        assert!(matches!(
            Phase1::read_file(0, "{".as_bytes()),
            Err(SimError::Decode(_))
        ));
    }

    #[test]
    fn read_direct_matches_population() {
        let populations = vec![ThreadPopulation::default(), population()];
        let sut = Phase1::read_direct(1, populations.as_slice()).unwrap();

        assert_eq!(sut.output_gids(), [100, -1]);
        assert_eq!(sut.netcons().len(), 5);
        assert_eq!(sut.input_gids(), [900]);
    }

    #[test]
    fn mismatched_lengths_rejected() {
        let mut broken = population();
        broken.netcon_srcgids.pop();
        assert!(matches!(
            Phase1::from_population(3, broken),
            Err(SimError::InvalidPopulation { thread: 3, .. })
        ));
    }
}
