use std::sync::mpsc::Sender as MpscSender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bus::BusReader;
use serde::Serialize;

use crate::condition::{WatchCondition, WatchFn};
use crate::error::{SimError, SimResult};
use crate::event::Event;
use crate::mechanism::{NetReceiveContext, PointProcess};
use crate::netcon::{NetCon, SourceRef};
use crate::netpar::NetParEvent;
use crate::presyn::OutputSpike;
use crate::queue::{EventQueue, QueueHandle};
use crate::raster::SpikeRecord;
use crate::routing::Routing;
use crate::types::{Gid, HashMap, TargetId};

pub const DEFAULT_TEPS: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverOutcome {
    Continue,
    IntervalEnd,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Reached,
    IntervalEnd,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThreadTiming {
    pub thread: usize,
    pub intervals: usize,
    pub wx: f64,
    pub ws: f64,
}

/// One simulation thread: its queue, routing tables, targets and state. Everything here is
/// owned by a single worker; the only way in from outside is the exchange.
#[derive(Debug)]
pub struct NetThread {
    id: usize,
    t: f64,
    teps: f64,
    queue: EventQueue<Event>,
    routing: Routing,
    targets: Vec<Box<dyn PointProcess>>,
    state: Vec<f64>,
    watches: Vec<WatchCondition>,
    thvar2presyn: HashMap<usize, Vec<usize>>,
    netpar: Option<NetParEvent>,
    spikes: Vec<SpikeRecord>,
    outbox: Vec<OutputSpike>,
    netcon_deliveries: usize,
    orphan_net_events: usize,
    touched: Vec<usize>,
    net_events: Vec<f64>,
}

impl NetThread {
    pub fn new(
        id: usize,
        routing: Routing,
        targets: Vec<Box<dyn PointProcess>>,
        state: Vec<f64>,
    ) -> SimResult<Self> {
        let invalid = |reason: String| SimError::InvalidPopulation { thread: id, reason };

        if routing.thread != id {
            return Err(invalid(format!(
                "routing was built for thread {}",
                routing.thread
            )));
        }

        let check_target = |target: TargetId| {
            if target.thread != id || target.index >= targets.len() {
                Err(invalid(format!("target {:?} is not on this thread", target)))
            } else {
                Ok(())
            }
        };

        let mut thvar2presyn: HashMap<usize, Vec<usize>> = HashMap::default();
        for (presyn_id, presyn) in routing.presyns.iter().enumerate() {
            if let Some(thvar) = presyn.thvar {
                if thvar >= state.len() {
                    return Err(invalid(format!(
                        "source {} watches state {} of {}",
                        presyn.gid,
                        thvar,
                        state.len()
                    )));
                }
                thvar2presyn.entry(thvar).or_default().push(presyn_id);
            }
            if let Some(pntsrc) = presyn.pntsrc {
                check_target(pntsrc)?;
            }
        }

        for target in routing.netcons.iter().filter_map(|netcon| netcon.target) {
            check_target(target)?;
        }

        Ok(Self {
            id,
            t: 0.0,
            teps: DEFAULT_TEPS,
            queue: EventQueue::new(),
            routing,
            targets,
            state,
            watches: Vec::new(),
            thvar2presyn,
            netpar: None,
            spikes: Vec::new(),
            outbox: Vec::new(),
            netcon_deliveries: 0,
            orphan_net_events: 0,
            touched: Vec::new(),
            net_events: Vec::new(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn t(&self) -> f64 {
        self.t
    }

    pub fn routing(&self) -> &Routing {
        &self.routing
    }

    pub fn state(&self) -> &[f64] {
        &self.state
    }

    pub fn target(&self, index: usize) -> &dyn PointProcess {
        self.targets[index].as_ref()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn spikes(&self) -> &[SpikeRecord] {
        &self.spikes
    }

    pub fn netpar(&self) -> Option<&NetParEvent> {
        self.netpar.as_ref()
    }

    pub fn netcon_deliveries(&self) -> usize {
        self.netcon_deliveries
    }

    /// Spikes emitted by artificial targets that have no source attached.
    pub fn orphan_net_events(&self) -> usize {
        self.orphan_net_events
    }

    pub fn set_teps(&mut self, teps: f64) {
        self.teps = teps;
    }

    pub fn set_exchange_interval(&mut self, interval: f64) {
        self.netpar = Some(NetParEvent::new(self.id, interval));
    }

    pub fn add_watch(
        &mut self,
        target_index: usize,
        nrflag: f64,
        evaluator: WatchFn,
    ) -> SimResult<usize> {
        if target_index >= self.targets.len() {
            return Err(SimError::InvalidPopulation {
                thread: self.id,
                reason: format!("watch on missing target {}", target_index),
            });
        }

        let mut watch = WatchCondition::new(TargetId::new(self.id, target_index), nrflag, evaluator);
        watch.init(&self.state);
        self.watches.push(watch);
        Ok(self.watches.len() - 1)
    }

    pub fn set_netcon_active(&mut self, netcon_id: usize, active: bool) -> SimResult<()> {
        match self.routing.netcons.get_mut(netcon_id) {
            Some(netcon) => {
                netcon.set_active(active);
                Ok(())
            }
            None => Err(SimError::UnknownNetCon {
                thread: self.id,
                netcon: netcon_id,
            }),
        }
    }

    pub fn timing(&self) -> ThreadTiming {
        ThreadTiming {
            thread: self.id,
            intervals: self.netpar.as_ref().map_or(0, NetParEvent::intervals),
            wx: self.netpar.as_ref().map_or(0.0, NetParEvent::wx),
            ws: self.netpar.as_ref().map_or(0.0, NetParEvent::ws),
        }
    }

    /// Seeds every detector from the current state, runs the targets' init hooks and arms the
    /// exchange tick.
    pub fn init(&mut self) -> SimResult<()> {
        for presyn in self.routing.presyns.iter_mut() {
            if let Some(value) = presyn.value(&self.state) {
                presyn.condition.init(value);
            }
        }
        for watch in &mut self.watches {
            watch.init(&self.state);
        }

        for index in 0..self.targets.len() {
            let target = TargetId::new(self.id, index);
            self.touched.clear();
            self.net_events.clear();

            let NetThread {
                t,
                queue,
                state,
                targets,
                touched,
                net_events,
                ..
            } = self;
            let mut ctx = NetReceiveContext::new(*t, target, None, queue, state, touched, net_events);
            targets[index].init(&mut ctx)?;

            self.after_receive(target, self.t)?;
        }

        if let Some(netpar) = self.netpar.as_mut() {
            if !netpar.is_armed() {
                netpar.send(self.t, &mut self.queue);
            }
        }

        Ok(())
    }

    /// Thread owning `event`. Indices that do not exist on this thread are rejected.
    pub fn thread_of(&self, event: &Event) -> SimResult<usize> {
        let owner = match event {
            Event::NetCon(netcon_id) => self
                .netcon(*netcon_id)?
                .target
                .map_or(self.id, |target| target.thread),
            Event::SelfEvent(self_event) => self_event.target.thread,
            Event::Discrete(Some(watch_id)) => match self.watches.get(*watch_id) {
                Some(watch) => watch.target.thread,
                None => return Err(self.missing(format!("watch condition {}", watch_id))),
            },
            Event::NetPar => self.netpar.as_ref().map_or(self.id, NetParEvent::ithread),
            Event::PreSyn(presyn_id) if *presyn_id >= self.routing.presyns.len() => {
                return Err(self.missing(format!("source {}", presyn_id)))
            }
            Event::InputPreSyn(input_id) if *input_id >= self.routing.input_presyns.len() => {
                return Err(self.missing(format!("input source {}", input_id)))
            }
            Event::Discrete(None) | Event::Tstop | Event::PreSyn(_) | Event::InputPreSyn(_) => {
                self.id
            }
        };
        Ok(owner)
    }

    fn netcon(&self, netcon_id: usize) -> SimResult<&NetCon> {
        self.routing
            .netcons
            .get(netcon_id)
            .ok_or(SimError::UnknownNetCon {
                thread: self.id,
                netcon: netcon_id,
            })
    }

    fn missing(&self, what: String) -> SimError {
        SimError::InvalidPopulation {
            thread: self.id,
            reason: format!("no {} on this thread", what),
        }
    }

    /// Hands `event` to its kind's send behaviour at time `t`. Sources fan out immediately;
    /// everything else is queued. Only movable events return a handle.
    pub fn send(&mut self, event: Event, t: f64) -> SimResult<Option<QueueHandle>> {
        let owner = self.thread_of(&event)?;
        if owner != self.id {
            return Err(SimError::ForeignEvent {
                thread: self.id,
                owner,
            });
        }

        match event {
            Event::PreSyn(presyn_id) => {
                self.presyn_send(presyn_id, t)?;
                Ok(None)
            }
            Event::InputPreSyn(input_id) => {
                self.fan_out(SourceRef::InputPreSyn(input_id), t)?;
                Ok(None)
            }
            Event::NetCon(netcon_id) => {
                let arrival = t + self.netcon(netcon_id)?.delay;
                if arrival < self.t {
                    return Err(SimError::InvalidDeliveryTime {
                        t: arrival,
                        now: self.t,
                    });
                }
                self.routing.netcons[netcon_id].send(netcon_id, t, &mut self.queue);
                Ok(None)
            }
            Event::NetPar => {
                if let Some(netpar) = self.netpar.as_mut() {
                    netpar.send(t, &mut self.queue);
                }
                Ok(None)
            }
            other => {
                if t < self.t {
                    return Err(SimError::InvalidDeliveryTime { t, now: self.t });
                }
                let handle = self.queue.insert(t, other);
                Ok(other.is_movable().then_some(handle))
            }
        }
    }

    pub fn move_self_event(&mut self, handle: QueueHandle, t: f64) -> SimResult<()> {
        if !matches!(self.queue.get(handle), Some((_, Event::SelfEvent(_)))) {
            return Err(SimError::StaleHandle);
        }
        if t < self.t {
            return Err(SimError::InvalidDeliveryTime { t, now: self.t });
        }
        self.queue.update(handle, t);
        Ok(())
    }

    pub fn cancel_self_event(&mut self, handle: QueueHandle) -> SimResult<()> {
        match self.queue.get(handle) {
            Some((_, Event::SelfEvent(_))) => {
                self.queue.remove(handle);
                Ok(())
            }
            _ => Err(SimError::StaleHandle),
        }
    }

    pub fn deliver(&mut self, t: f64, event: Event) -> SimResult<DeliverOutcome> {
        if t < self.t {
            return Err(SimError::InvalidDeliveryTime { t, now: self.t });
        }
        let owner = self.thread_of(&event)?;
        if owner != self.id {
            return Err(SimError::ForeignEvent {
                thread: self.id,
                owner,
            });
        }
        self.t = t;

        match event {
            Event::Discrete(None) => {}
            Event::Discrete(Some(watch_id)) => {
                let watch = &self.watches[watch_id];
                let (target, nrflag) = (watch.target, watch.nrflag);
                self.deliver_to_target(target, t, None, nrflag)?;
            }
            Event::Tstop => {
                log::debug!("thread {}: stop requested at t={}", self.id, t);
                return Ok(DeliverOutcome::Stop);
            }
            Event::NetCon(netcon_id) => {
                let netcon = self.netcon(netcon_id)?;
                if let (true, Some(target)) = (netcon.active, netcon.target) {
                    self.netcon_deliveries += 1;
                    self.deliver_to_target(target, t, Some(netcon_id), 0.0)?;
                }
            }
            Event::SelfEvent(self_event) => {
                self.deliver_to_target(self_event.target, t, self_event.weight, self_event.flag)?;
            }
            Event::PreSyn(presyn_id) => self.presyn_send(presyn_id, t)?,
            Event::NetPar => {
                if let Some(netpar) = self.netpar.as_mut() {
                    netpar.deliver(t);
                }
                return Ok(DeliverOutcome::IntervalEnd);
            }
            Event::InputPreSyn(input_id) => {
                self.fan_out(SourceRef::InputPreSyn(input_id), t)?;
            }
        }

        Ok(DeliverOutcome::Continue)
    }

    /// Delivers every event due at or before `t_end`, stopping early at an exchange tick or a
    /// stop request. Events left in the queue stay there.
    pub fn deliver_until(&mut self, t_end: f64) -> SimResult<DrainOutcome> {
        while let Some((t, event)) = self.queue.pop_until(t_end) {
            match self.deliver(t, event)? {
                DeliverOutcome::Continue => {}
                DeliverOutcome::IntervalEnd => return Ok(DrainOutcome::IntervalEnd),
                DeliverOutcome::Stop => return Ok(DrainOutcome::Stopped),
            }
        }

        if t_end > self.t {
            self.t = t_end;
        }
        Ok(DrainOutcome::Reached)
    }

    /// Routes a spike of `gid` that reached this thread through the exchange.
    pub fn receive_spike(&mut self, gid: Gid, t: f64) -> SimResult<usize> {
        let input_id = self
            .routing
            .input_presyn_for(gid)
            .ok_or(SimError::UnknownInput { gid })?;
        self.fan_out(SourceRef::InputPreSyn(input_id), t)
    }

    /// Dispatches the spikes gathered by the last exchange and re-arms the exchange tick.
    pub fn complete_exchange(
        &mut self,
        incoming: &[(Gid, f64)],
        waited: Option<Duration>,
    ) -> SimResult<usize> {
        let dispatch_start = Instant::now();
        let mut sent = 0;
        for (gid, t) in incoming {
            sent += self.receive_spike(*gid, *t)?;
        }

        if let Some(netpar) = self.netpar.as_mut() {
            if let Some(waited) = waited {
                netpar.record_exchange(waited);
            }
            netpar.record_spike_dispatch(dispatch_start.elapsed());
            if !netpar.is_armed() {
                netpar.send(self.t, &mut self.queue);
            }
        }

        Ok(sent)
    }

    /// Runs every state-watching detector at the current time. Used by integrators that change
    /// state outside of `net_receive`.
    pub fn check_thresholds(&mut self) -> SimResult<usize> {
        self.detect_crossings(None)
    }

    /// Like `check_thresholds`, with crossing times interpolated inside the last step of `dt`.
    pub fn check_thresholds_interpolated(&mut self, dt: f64) -> SimResult<usize> {
        self.detect_crossings(Some(dt))
    }

    pub fn take_outbox(&mut self) -> Vec<OutputSpike> {
        std::mem::take(&mut self.outbox)
    }

    fn detect_crossings(&mut self, dt: Option<f64>) -> SimResult<usize> {
        let mut fired = Vec::new();
        for (presyn_id, presyn) in self.routing.presyns.iter_mut().enumerate() {
            if let Some(value) = presyn.value(&self.state) {
                let crossing = match dt {
                    Some(dt) => presyn
                        .condition
                        .check_interpolated(value, self.t, dt, self.teps),
                    None => presyn.condition.check(value, self.t, self.teps),
                };
                if let Some(t_cross) = crossing {
                    fired.push((presyn_id, t_cross));
                }
            }
        }

        let count = fired.len();
        for (presyn_id, t_cross) in fired {
            self.presyn_send(presyn_id, t_cross)?;
        }
        self.check_watches();

        Ok(count)
    }

    fn check_watches(&mut self) {
        for (watch_id, watch) in self.watches.iter_mut().enumerate() {
            if let Some(t_cross) = watch.check(&self.state, self.t, self.teps) {
                self.queue
                    .insert(t_cross.max(self.t), Event::Discrete(Some(watch_id)));
            }
        }
    }

    fn deliver_to_target(
        &mut self,
        target: TargetId,
        t: f64,
        weight: Option<usize>,
        flag: f64,
    ) -> SimResult<()> {
        if target.index >= self.targets.len() {
            return Err(self.missing(format!("target {}", target.index)));
        }
        if let Some(netcon_id) = weight {
            self.netcon(netcon_id)?;
        }
        self.touched.clear();
        self.net_events.clear();

        let NetThread {
            queue,
            state,
            targets,
            routing,
            touched,
            net_events,
            ..
        } = self;

        let weights: &mut [f64] = match weight {
            Some(netcon_id) => {
                let range = routing.netcons[netcon_id].weight_range();
                &mut routing.weights[range]
            }
            None => Default::default(),
        };

        let mut ctx = NetReceiveContext::new(t, target, weight, queue, state, touched, net_events);
        targets[target.index].net_receive(&mut ctx, weights, flag)?;

        self.after_receive(target, t)
    }

    /// Follow-up of a target callback: spikes it emitted, then detectors on the state it wrote.
    fn after_receive(&mut self, target: TargetId, t: f64) -> SimResult<()> {
        let net_events = std::mem::take(&mut self.net_events);
        for t_event in net_events.iter().copied() {
            match self.routing.presyn_for_target(target) {
                Some(presyn_id) if t_event <= self.t => self.presyn_send(presyn_id, t_event)?,
                Some(presyn_id) => {
                    self.queue.insert(t_event, Event::PreSyn(presyn_id));
                }
                None => {
                    self.orphan_net_events += 1;
                    log::debug!(
                        "thread {}: target {} emitted a spike at t={} without a source",
                        self.id,
                        target.index,
                        t_event
                    );
                }
            }
        }
        self.net_events = net_events;

        if self.touched.is_empty() {
            return Ok(());
        }

        let mut touched = std::mem::take(&mut self.touched);
        touched.sort_unstable();
        touched.dedup();

        let mut fired = Vec::new();
        for index in &touched {
            if let Some(presyn_ids) = self.thvar2presyn.get(index) {
                for presyn_id in presyn_ids {
                    let presyn = &mut self.routing.presyns[*presyn_id];
                    let value = self.state[*index] - presyn.threshold;
                    if let Some(t_cross) = presyn.condition.check(value, t, self.teps) {
                        fired.push((*presyn_id, t_cross));
                    }
                }
            }
        }
        self.touched = touched;

        for (presyn_id, t_cross) in fired {
            self.presyn_send(presyn_id, t_cross)?;
        }
        self.check_watches();

        Ok(())
    }

    fn presyn_send(&mut self, presyn_id: usize, t: f64) -> SimResult<()> {
        let gid = self.routing.presyns[presyn_id].gid;
        if gid >= 0 {
            self.spikes.push(SpikeRecord { t, gid });
        }
        if let Some(output_spike) = self.routing.output_spike(presyn_id, t) {
            self.outbox.push(output_spike);
        }

        self.fan_out(SourceRef::PreSyn(presyn_id), t)?;
        Ok(())
    }

    fn fan_out(&mut self, source: SourceRef, t: f64) -> SimResult<usize> {
        let routing = &self.routing;
        let mut sent = 0;

        for netcon_id in routing.listeners(source) {
            let netcon = &routing.netcons[*netcon_id];
            if !netcon.is_deliverable() {
                continue;
            }

            let arrival = t + netcon.delay;
            if arrival < self.t {
                return Err(SimError::InvalidDeliveryTime {
                    t: arrival,
                    now: self.t,
                });
            }
            netcon.send(*netcon_id, t, &mut self.queue);
            sent += 1;
        }

        Ok(sent)
    }
}

#[derive(Debug, Clone)]
pub enum Request {
    Interval {
        t_end: f64,
        incoming: Arc<Vec<Vec<(Gid, f64)>>>,
    },
    SetActive {
        thread: usize,
        netcon: usize,
        active: bool,
    },
    CollectSpikes,
    CollectTimings,
}

#[derive(Debug, Default)]
pub struct IntervalResult {
    pub outgoing: Vec<OutputSpike>,
    pub netcon_deliveries: usize,
    pub stopped: bool,
}

/// Worker loop for a group of threads pinned to one OS thread. `incoming` is indexed by
/// thread id and holds the spikes each thread must dispatch before draining.
pub fn run(
    threads: &mut [NetThread],
    mut rx: BusReader<Request>,
    interval_tx: MpscSender<SimResult<IntervalResult>>,
    spikes_tx: MpscSender<Vec<SpikeRecord>>,
    timings_tx: MpscSender<Vec<ThreadTiming>>,
) {
    let mut exchange_started: Option<Instant> = None;

    while let Ok(request) = rx.recv() {
        match request {
            Request::Interval { t_end, incoming } => {
                let waited = exchange_started.map(|started| started.elapsed());
                let result = run_interval(threads, t_end, &incoming, waited);
                exchange_started = Some(Instant::now());

                if interval_tx.send(result).is_err() {
                    break;
                }
            }
            Request::SetActive {
                thread,
                netcon,
                active,
            } => {
                for net_thread in threads.iter_mut().filter(|th| th.id() == thread) {
                    if let Err(err) = net_thread.set_netcon_active(netcon, active) {
                        log::warn!("{}", err);
                    }
                }
            }
            Request::CollectSpikes => {
                let spikes = threads
                    .iter()
                    .flat_map(|net_thread| net_thread.spikes().iter().copied())
                    .collect();
                if spikes_tx.send(spikes).is_err() {
                    break;
                }
            }
            Request::CollectTimings => {
                let timings = threads.iter().map(NetThread::timing).collect();
                if timings_tx.send(timings).is_err() {
                    break;
                }
            }
        }
    }
}

fn run_interval(
    threads: &mut [NetThread],
    t_end: f64,
    incoming: &[Vec<(Gid, f64)>],
    waited: Option<Duration>,
) -> SimResult<IntervalResult> {
    let mut result = IntervalResult::default();

    for net_thread in threads.iter_mut() {
        let deliveries_before = net_thread.netcon_deliveries();
        let spikes = incoming
            .get(net_thread.id())
            .map(Vec::as_slice)
            .unwrap_or_default();
        net_thread.complete_exchange(spikes, waited)?;

        if net_thread.deliver_until(t_end)? == DrainOutcome::Stopped {
            result.stopped = true;
        }

        result.outgoing.extend(net_thread.take_outbox());
        result.netcon_deliveries += net_thread.netcon_deliveries() - deliveries_before;
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::ConditionEvent;
    use crate::mechanism::{Accumulator, SpikeGenerator};
    use crate::presyn::{InputPreSyn, PreSyn};
    use crate::routing::build_listener_table;
    use float_cmp::assert_approx_eq;
    use itertools::assert_equal;
    use std::sync::Mutex;

    type ProbeLog = Arc<Mutex<Vec<(f64, Vec<f64>, f64)>>>;

    /// Records every delivery it receives.
    #[derive(Debug, Default)]
    struct Probe {
        log: ProbeLog,
    }

    impl PointProcess for Probe {
        fn net_receive(
            &mut self,
            ctx: &mut NetReceiveContext<'_>,
            weights: &mut [f64],
            flag: f64,
        ) -> SimResult<()> {
            self.log
                .lock()
                .unwrap()
                .push((ctx.t(), weights.to_vec(), flag));
            Ok(())
        }
    }

    fn presyn(gid: Gid, thvar: Option<usize>, pntsrc: Option<TargetId>) -> PreSyn {
        PreSyn {
            gid,
            threshold: 0.0,
            thvar,
            pntsrc,
            nc_index: 0,
            nc_cnt: 0,
            output_index: None,
            localgid: 0,
            condition: ConditionEvent::new(),
        }
    }

    fn netcon(source: SourceRef, target: usize, delay: f64, weight_index: usize) -> NetCon {
        NetCon {
            active: true,
            delay,
            target: Some(TargetId::new(0, target)),
            source: Some(source),
            weight_index,
            weight_cnt: 1,
        }
    }

    fn routing(
        mut presyns: Vec<PreSyn>,
        input_gids: &[Gid],
        netcons: Vec<NetCon>,
        weights: Vec<f64>,
    ) -> Routing {
        let mut input_presyns: Vec<InputPreSyn> = input_gids
            .iter()
            .map(|gid| InputPreSyn {
                gid: *gid,
                nc_index: 0,
                nc_cnt: 0,
            })
            .collect();

        let (table, ranges) = build_listener_table(presyns.len(), input_presyns.len(), &netcons);
        let (local_ranges, input_ranges) = ranges.split_at(presyns.len());
        for (presyn, (start, count)) in presyns.iter_mut().zip(local_ranges) {
            presyn.nc_index = *start;
            presyn.nc_cnt = *count;
        }
        for (input, (start, count)) in input_presyns.iter_mut().zip(input_ranges) {
            input.nc_index = *start;
            input.nc_cnt = *count;
        }

        let pnt2presyn = presyns
            .iter()
            .enumerate()
            .filter_map(|(idx, presyn)| presyn.pntsrc.map(|target| (target, idx)))
            .collect();
        let gid2in = input_presyns
            .iter()
            .enumerate()
            .map(|(idx, input)| (input.gid, idx))
            .collect();

        Routing {
            thread: 0,
            presyns,
            input_presyns,
            netcons,
            netcon_in_presyn_order: table,
            weights,
            gid2in,
            pnt2presyn,
        }
    }

    #[test]
    fn fan_out_at_arrival_times() {
        let routing = routing(
            vec![presyn(100, Some(0), None)],
            &[],
            vec![
                netcon(SourceRef::PreSyn(0), 0, 1.0, 0),
                netcon(SourceRef::PreSyn(0), 0, 2.0, 1),
                netcon(SourceRef::PreSyn(0), 0, 0.5, 2),
            ],
            vec![0.1, 0.2, 0.3],
        );
        let mut sut = NetThread::new(0, routing, vec![Box::new(Accumulator::new(1))], vec![0.0; 2])
            .unwrap();
        sut.init().unwrap();

        sut.send(Event::PreSyn(0), 10.0).unwrap();

        let mut delivered = Vec::new();
        while let Some((t, event)) = sut.queue.pop() {
            if let Event::NetCon(netcon_id) = event {
                delivered.push((t, sut.routing.netcon_weights(netcon_id)[0]));
            }
            sut.deliver(t, event).unwrap();
        }

        assert_eq!(delivered, [(10.5, 0.3), (11.0, 0.1), (12.0, 0.2)]);
        assert_approx_eq!(f64, sut.state()[1], 0.6);
        assert_eq!(sut.netcon_deliveries(), 3);
        assert_eq!(sut.spikes(), [SpikeRecord { t: 10.0, gid: 100 }]);
    }

    #[test]
    fn input_without_listeners_delivers_nothing() {
        let routing = routing(Vec::new(), &[7], Vec::new(), Vec::new());
        let mut sut = NetThread::new(0, routing, Vec::new(), Vec::new()).unwrap();

        assert_eq!(sut.receive_spike(7, 3.0).unwrap(), 0);
        assert_eq!(sut.queue_len(), 0);
        assert!(matches!(
            sut.receive_spike(8, 3.0),
            Err(SimError::UnknownInput { gid: 8 })
        ));
    }

    #[test]
    fn threshold_crossing_fires_once_per_crossing() {
        let routing = routing(
            vec![presyn(3, Some(0), None)],
            &[],
            vec![netcon(SourceRef::PreSyn(0), 0, 1.0, 0)],
            vec![1.0],
        );
        let mut sut =
            NetThread::new(0, routing, vec![Box::new(Accumulator::new(1))], vec![-1.0, 0.0])
                .unwrap();
        sut.init().unwrap();

        sut.state[0] = 0.5;
        assert_eq!(sut.check_thresholds().unwrap(), 1);
        sut.state[0] = 0.7;
        assert_eq!(sut.check_thresholds().unwrap(), 0);
        sut.state[0] = 0.0;
        assert_eq!(sut.check_thresholds().unwrap(), 0);
        sut.state[0] = 0.1;
        assert_eq!(sut.check_thresholds().unwrap(), 1);

        assert_eq!(sut.spikes().len(), 2);
    }

    #[test]
    fn artificial_cell_chain() {
        // generator on target 0 drives a firing accumulator on target 1
        let routing = routing(
            vec![
                presyn(-1, None, Some(TargetId::new(0, 0))),
                presyn(2, None, Some(TargetId::new(0, 1))),
            ],
            &[],
            vec![netcon(SourceRef::PreSyn(0), 1, 0.5, 0)],
            vec![0.6],
        );
        let targets: Vec<Box<dyn PointProcess>> = vec![
            Box::new(SpikeGenerator::new(1.0, 1.0, 4)),
            Box::new(Accumulator::firing(0, 1.0)),
        ];
        let mut sut = NetThread::new(0, routing, targets, vec![0.0]).unwrap();
        sut.init().unwrap();

        assert_eq!(sut.deliver_until(10.0).unwrap(), DrainOutcome::Reached);

        // local-only sources are not recorded
        assert_equal(
            sut.spikes().iter().map(|spike| (spike.gid, spike.t)),
            [(2, 2.5), (2, 4.5)],
        );
        assert_approx_eq!(f64, sut.t(), 10.0);
    }

    #[test]
    fn watch_delivers_nrflag() {
        fn above_half(_target: TargetId, state: &[f64]) -> f64 {
            state[0] - 0.5
        }

        let routing = routing(
            Vec::new(),
            &[9],
            vec![netcon(SourceRef::InputPreSyn(0), 0, 1.0, 0)],
            vec![0.3],
        );
        let targets: Vec<Box<dyn PointProcess>> = vec![Box::new(Accumulator::new(0))];
        let mut sut = NetThread::new(0, routing, targets, vec![0.0]).unwrap();
        let watch_id = sut.add_watch(0, 2.0, above_half).unwrap();
        sut.init().unwrap();

        sut.receive_spike(9, 0.0).unwrap();
        sut.receive_spike(9, 1.0).unwrap();

        let mut discrete = Vec::new();
        while let Some((t, event)) = sut.queue.pop() {
            if let Event::Discrete(Some(id)) = event {
                discrete.push((t, id));
            }
            sut.deliver(t, event).unwrap();
        }

        // 0.3 then 0.6: one crossing, at the second delivery
        assert_eq!(discrete.len(), 1);
        assert_eq!(discrete[0].1, watch_id);
        assert_approx_eq!(f64, discrete[0].0, 2.0 + DEFAULT_TEPS);
    }

    #[test]
    fn watch_at_threshold_does_not_fire() {
        fn exactly(_target: TargetId, state: &[f64]) -> f64 {
            state[0] - 1.0
        }

        let routing = routing(Vec::new(), &[], Vec::new(), Vec::new());
        let targets: Vec<Box<dyn PointProcess>> = vec![Box::new(Accumulator::new(0))];
        let mut sut = NetThread::new(0, routing, targets, vec![0.0]).unwrap();
        sut.add_watch(0, 1.0, exactly).unwrap();
        sut.init().unwrap();

        sut.state[0] = 1.0;
        sut.check_thresholds().unwrap();
        assert_eq!(sut.queue_len(), 0);
    }

    #[test]
    fn tstop_leaves_remaining_events() {
        let routing = routing(Vec::new(), &[], Vec::new(), Vec::new());
        let probe = Probe::default();
        let log = probe.log.clone();
        let targets: Vec<Box<dyn PointProcess>> = vec![Box::new(probe)];
        let mut sut = NetThread::new(0, routing, targets, Vec::new()).unwrap();
        sut.init().unwrap();

        let self_event = crate::event::SelfEvent {
            target: TargetId::new(0, 0),
            flag: 1.0,
            weight: None,
        };
        sut.send(Event::Tstop, 2.0).unwrap();
        let handle = sut.send(Event::SelfEvent(self_event), 3.0).unwrap();
        assert!(handle.is_some());

        assert_eq!(sut.deliver_until(5.0).unwrap(), DrainOutcome::Stopped);
        assert_approx_eq!(f64, sut.t(), 2.0);
        assert_eq!(sut.queue_len(), 1);
        assert!(log.lock().unwrap().is_empty());

        assert_eq!(sut.deliver_until(5.0).unwrap(), DrainOutcome::Reached);
        assert_eq!(*log.lock().unwrap(), [(3.0, Vec::new(), 1.0)]);
    }

    #[test]
    fn self_event_move_and_cancel() {
        let routing = routing(Vec::new(), &[], Vec::new(), Vec::new());
        let targets: Vec<Box<dyn PointProcess>> = vec![Box::new(Probe::default())];
        let mut sut = NetThread::new(0, routing, targets, Vec::new()).unwrap();

        let self_event = Event::SelfEvent(crate::event::SelfEvent {
            target: TargetId::new(0, 0),
            flag: 1.0,
            weight: None,
        });
        let handle = sut.send(self_event, 3.0).unwrap().unwrap();
        sut.move_self_event(handle, 4.0).unwrap();
        assert_eq!(sut.queue.peek_time(), Some(4.0));

        sut.cancel_self_event(handle).unwrap();
        assert!(matches!(
            sut.cancel_self_event(handle),
            Err(SimError::StaleHandle)
        ));

        assert_eq!(sut.send(Event::Discrete(None), 1.0).unwrap(), None);
    }

    #[test]
    fn delivery_in_the_past_rejected() {
        let routing = routing(Vec::new(), &[], Vec::new(), Vec::new());
        let mut sut = NetThread::new(0, routing, Vec::new(), Vec::new()).unwrap();
        sut.deliver(5.0, Event::Discrete(None)).unwrap();

        assert!(matches!(
            sut.deliver(4.0, Event::Discrete(None)),
            Err(SimError::InvalidDeliveryTime { .. })
        ));
        assert!(matches!(
            sut.send(Event::Discrete(None), 4.0),
            Err(SimError::InvalidDeliveryTime { .. })
        ));
    }

    #[test]
    fn foreign_event_rejected() {
        let routing = routing(Vec::new(), &[], Vec::new(), Vec::new());
        let mut sut = NetThread::new(0, routing, Vec::new(), Vec::new()).unwrap();
        let foreign = Event::SelfEvent(crate::event::SelfEvent {
            target: TargetId::new(1, 0),
            flag: 0.0,
            weight: None,
        });

        assert!(matches!(
            sut.send(foreign, 1.0),
            Err(SimError::ForeignEvent { thread: 0, owner: 1 })
        ));
    }

    #[test]
    fn unknown_indices_rejected() {
        let routing = routing(
            vec![presyn(1, Some(0), None)],
            &[4],
            vec![netcon(SourceRef::PreSyn(0), 0, 1.0, 0)],
            vec![1.0],
        );
        let targets: Vec<Box<dyn PointProcess>> = vec![Box::new(Accumulator::new(1))];
        let mut sut = NetThread::new(0, routing, targets, vec![0.0; 2]).unwrap();

        assert!(matches!(
            sut.send(Event::NetCon(5), 1.0),
            Err(SimError::UnknownNetCon { thread: 0, netcon: 5 })
        ));
        assert!(matches!(
            sut.deliver(1.0, Event::NetCon(5)),
            Err(SimError::UnknownNetCon { thread: 0, netcon: 5 })
        ));
        for event in [Event::PreSyn(1), Event::InputPreSyn(1), Event::Discrete(Some(0))] {
            assert!(matches!(
                sut.send(event, 1.0),
                Err(SimError::InvalidPopulation { thread: 0, .. })
            ));
        }

        let missing_target = Event::SelfEvent(crate::event::SelfEvent {
            target: TargetId::new(0, 3),
            flag: 0.0,
            weight: None,
        });
        assert!(matches!(
            sut.deliver(2.0, missing_target),
            Err(SimError::InvalidPopulation { thread: 0, .. })
        ));
        assert_eq!(sut.queue_len(), 0);
    }

    #[test]
    fn interpolated_crossing_sets_spike_time() {
        let routing = routing(
            vec![presyn(8, Some(0), None)],
            &[],
            vec![
                netcon(SourceRef::PreSyn(0), 0, 1.0, 0),
                netcon(SourceRef::PreSyn(0), 0, 2.0, 1),
            ],
            vec![0.5, 0.25],
        );
        let log = ProbeLog::default();
        let targets: Vec<Box<dyn PointProcess>> = vec![Box::new(Probe { log: log.clone() })];
        let mut sut = NetThread::new(0, routing, targets, vec![-3.0]).unwrap();
        sut.set_teps(0.0);
        sut.init().unwrap();

        sut.deliver_until(10.0).unwrap();
        assert_eq!(sut.check_thresholds_interpolated(0.5).unwrap(), 0);

        // crosses zero three quarters into the step
        sut.deliver_until(10.5).unwrap();
        sut.state[0] = 1.0;
        assert_eq!(sut.check_thresholds_interpolated(0.5).unwrap(), 1);
        assert_eq!(sut.spikes().len(), 1);
        assert_approx_eq!(f64, sut.spikes()[0].t, 10.375);

        sut.deliver_until(20.0).unwrap();
        let deliveries = log.lock().unwrap();
        assert_eq!(deliveries.len(), 2);
        assert_approx_eq!(f64, deliveries[0].0, 11.375);
        assert_approx_eq!(f64, deliveries[1].0, 12.375);
        assert_equal(
            deliveries.iter().map(|(_, weights, _)| weights.clone()),
            [vec![0.5], vec![0.25]],
        );
    }

    #[test]
    fn inactive_connection_skipped() {
        let routing = routing(
            vec![presyn(1, Some(0), None)],
            &[],
            vec![
                netcon(SourceRef::PreSyn(0), 0, 1.0, 0),
                netcon(SourceRef::PreSyn(0), 0, 1.0, 1),
            ],
            vec![1.0, 2.0],
        );
        let targets: Vec<Box<dyn PointProcess>> = vec![Box::new(Accumulator::new(1))];
        let mut sut = NetThread::new(0, routing, targets, vec![0.0; 2]).unwrap();
        sut.set_netcon_active(1, false).unwrap();
        assert!(matches!(
            sut.set_netcon_active(2, false),
            Err(SimError::UnknownNetCon { .. })
        ));

        sut.send(Event::PreSyn(0), 0.0).unwrap();
        sut.deliver_until(5.0).unwrap();

        assert_approx_eq!(f64, sut.state()[1], 1.0);
        assert_eq!(sut.routing().netcons().len(), 2);
    }

    #[test]
    fn exchange_tick_ends_interval() {
        let routing = routing(Vec::new(), &[4], Vec::new(), Vec::new());
        let mut sut = NetThread::new(0, routing, Vec::new(), Vec::new()).unwrap();
        sut.set_exchange_interval(0.5);
        sut.init().unwrap();

        assert_eq!(sut.deliver_until(2.0).unwrap(), DrainOutcome::IntervalEnd);
        assert_approx_eq!(f64, sut.t(), 0.5);

        sut.complete_exchange(&[(4, 0.25)], Some(Duration::from_millis(1)))
            .unwrap();
        assert_eq!(sut.deliver_until(2.0).unwrap(), DrainOutcome::IntervalEnd);
        assert_approx_eq!(f64, sut.t(), 1.0);

        let timing = sut.timing();
        assert_eq!(timing.intervals, 2);
        assert!(timing.wx > 0.0);
    }

    #[test]
    fn invalid_population_rejected() {
        let bad_thvar = routing(vec![presyn(1, Some(3), None)], &[], Vec::new(), Vec::new());
        assert!(matches!(
            NetThread::new(0, bad_thvar, Vec::new(), vec![0.0]),
            Err(SimError::InvalidPopulation { .. })
        ));

        let bad_target = routing(
            vec![presyn(1, Some(0), None)],
            &[],
            vec![netcon(SourceRef::PreSyn(0), 2, 1.0, 0)],
            vec![1.0],
        );
        assert!(matches!(
            NetThread::new(0, bad_target, Vec::new(), vec![0.0]),
            Err(SimError::InvalidPopulation { .. })
        ));
    }
}
