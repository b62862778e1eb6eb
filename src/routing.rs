use crate::netcon::{NetCon, SourceRef};
use crate::presyn::{InputPreSyn, OutputSpike, PreSyn};
use crate::types::{Gid, HashMap, TargetId};

/// Per-thread spike routing tables as produced by the loader. Fixed after loading apart from
/// the active flags of the connections.
#[derive(Debug, Clone, Default)]
pub struct Routing {
    pub(crate) thread: usize,
    pub(crate) presyns: Vec<PreSyn>,
    pub(crate) input_presyns: Vec<InputPreSyn>,
    pub(crate) netcons: Vec<NetCon>,
    pub(crate) netcon_in_presyn_order: Vec<usize>,
    pub(crate) weights: Vec<f64>,
    pub(crate) gid2in: HashMap<Gid, usize>,
    pub(crate) pnt2presyn: HashMap<TargetId, usize>,
}

impl Routing {
    pub fn thread(&self) -> usize {
        self.thread
    }

    pub fn presyns(&self) -> &[PreSyn] {
        &self.presyns
    }

    pub fn input_presyns(&self) -> &[InputPreSyn] {
        &self.input_presyns
    }

    pub fn netcons(&self) -> &[NetCon] {
        &self.netcons
    }

    pub fn netcon_weights(&self, netcon_id: usize) -> &[f64] {
        &self.weights[self.netcons[netcon_id].weight_range()]
    }

    /// Connection ids listening to `source`, contiguous in the source-ordered table.
    pub fn listeners(&self, source: SourceRef) -> &[usize] {
        let range = match source {
            SourceRef::PreSyn(idx) => self.presyns[idx].listener_range(),
            SourceRef::InputPreSyn(idx) => self.input_presyns[idx].listener_range(),
        };
        &self.netcon_in_presyn_order[range]
    }

    pub fn input_presyn_for(&self, gid: Gid) -> Option<usize> {
        self.gid2in.get(&gid).copied()
    }

    pub fn presyn_for_target(&self, target: TargetId) -> Option<usize> {
        self.pnt2presyn.get(&target).copied()
    }

    pub fn input_gids(&self) -> impl Iterator<Item = Gid> + '_ {
        self.input_presyns.iter().map(|input_presyn| input_presyn.gid)
    }

    /// Smallest delay of a deliverable connection fed by the exchange.
    pub fn min_input_delay(&self) -> Option<f64> {
        self.netcons
            .iter()
            .filter(|netcon| {
                netcon.is_deliverable() && matches!(netcon.source, Some(SourceRef::InputPreSyn(_)))
            })
            .map(|netcon| netcon.delay)
            .min_by(|a, b| a.total_cmp(b))
    }

    pub(crate) fn output_spike(&self, presyn_idx: usize, t: f64) -> Option<OutputSpike> {
        let presyn = &self.presyns[presyn_idx];
        presyn.output_index.map(|output_index| OutputSpike {
            gid: presyn.gid,
            output_index,
            localgid: presyn.localgid,
            t,
        })
    }
}

/// Two-pass build of the source-ordered connection table: count listeners per source, turn the
/// counts into start offsets, then place connection ids in their original relative order.
/// Returns the table and one `(nc_index, nc_cnt)` pair per source, local sources first.
pub(crate) fn build_listener_table(
    num_presyns: usize,
    num_input_presyns: usize,
    netcons: &[NetCon],
) -> (Vec<usize>, Vec<(usize, usize)>) {
    let source_slot = |source: SourceRef| match source {
        SourceRef::PreSyn(idx) => idx,
        SourceRef::InputPreSyn(idx) => num_presyns + idx,
    };

    let mut counts = vec![0usize; num_presyns + num_input_presyns];
    for source in netcons.iter().filter_map(|netcon| netcon.source) {
        counts[source_slot(source)] += 1;
    }

    let mut ranges = Vec::with_capacity(counts.len());
    let mut next_start = 0;
    for count in &counts {
        ranges.push((next_start, *count));
        next_start += count;
    }

    let mut cursor: Vec<usize> = ranges.iter().map(|(start, _)| *start).collect();
    let mut table = vec![0usize; next_start];
    for (netcon_id, netcon) in netcons.iter().enumerate() {
        if let Some(source) = netcon.source {
            let slot = source_slot(source);
            table[cursor[slot]] = netcon_id;
            cursor[slot] += 1;
        }
    }

    (table, ranges)
}
