use std::sync::mpsc::channel as mpsc_channel;
use std::sync::mpsc::Receiver as MpscReceiver;
use std::sync::Arc;
use std::thread::JoinHandle;

use bus::Bus;
use core_affinity::CoreId;
use simple_error::SimpleError;

use crate::condition::WatchFn;
use crate::directory::{DirectoryBuilder, SourceDirectory, SourceLocation};
use crate::error::{SimError, SimResult};
use crate::mechanism::PointProcess;
use crate::params::{self, SimParams};
use crate::phase1::Phase1;
use crate::presyn::OutputSpike;
use crate::raster::{SpikeRaster, SpikeRecord};
use crate::routing::Routing;
use crate::thread::{self as net_thread, IntervalResult, NetThread, Request, ThreadTiming};
use crate::transport::{Transport, WireSpike};
use crate::types::{Gid, HashMap};
use crate::util;

/// Exchange interval used when no connection crosses a thread boundary.
pub const DEFAULT_EXCHANGE_INTERVAL: f64 = 1.0;

pub struct WatchSpec {
    pub target: usize,
    pub nrflag: f64,
    pub evaluator: WatchFn,
}

/// Targets, state and watch conditions of one simulation thread.
#[derive(Default)]
pub struct ThreadModel {
    pub targets: Vec<Box<dyn PointProcess>>,
    pub state: Vec<f64>,
    pub watches: Vec<WatchSpec>,
}

/// Loads the network and starts the workers. Simulation thread `i` gets a copy of
/// `groups[i % groups.len()]` shifted into replica `i / groups.len()`; `build_model` is called
/// with `(thread, group, replica)`.
pub fn create_simulation<F>(
    params: SimParams,
    groups: Vec<Phase1>,
    mut build_model: F,
    mut transport: Box<dyn Transport>,
) -> SimResult<Simulation>
where
    F: FnMut(usize, usize, usize) -> SimResult<ThreadModel>,
{
    params::validate_sim_params(&params)?;
    if groups.is_empty() {
        return Err(SimpleError::new("at least one population group is required").into());
    }

    let num_groups = groups.len();
    let num_threads = num_groups * params.num_replicas;

    let mut phase1s = Vec::with_capacity(num_threads);
    for thread in 0..num_threads {
        let imult = thread / num_groups;
        let mut phase1 = groups[thread % num_groups].clone();
        phase1.shift_gids(imult, params.gid_space)?;
        if params.extracon > 0 {
            phase1.add_extracon(params.extracon, params.num_replicas, params.gid_space)?;
        }
        phase1s.push(phase1);
    }

    let mut builder = DirectoryBuilder::new(params.gid_space, params.compress_spikes);
    for (thread, phase1) in phase1s.iter().enumerate() {
        for gid in phase1.output_gids().iter().filter(|gid| **gid >= 0) {
            builder.register_output(thread, *gid)?;
        }
        for gid in phase1.input_gids() {
            builder.declare_input(*gid);
        }
    }
    let rank_outputs = transport.allgather_gids(builder.local_outputs())?;
    let directory = Arc::new(builder.build(transport.rank(), rank_outputs)?);

    let routings = phase1s
        .into_iter()
        .enumerate()
        .map(|(thread, phase1)| phase1.populate(thread, thread / num_groups, &directory))
        .collect::<SimResult<Vec<_>>>()?;

    let local_min_delay = routings
        .iter()
        .filter_map(Routing::min_input_delay)
        .min_by(|a, b| a.total_cmp(b))
        .unwrap_or(f64::INFINITY);
    let min_delay = transport.allreduce_min(local_min_delay)?;
    let interval = choose_exchange_interval(params.exchange_interval, min_delay)?;

    let netcon_counts: Vec<usize> = routings
        .iter()
        .map(|routing| routing.netcons().len())
        .collect();
    let mut subscribers: HashMap<Gid, Vec<usize>> = HashMap::default();
    let mut threads = Vec::with_capacity(num_threads);
    for (thread, routing) in routings.into_iter().enumerate() {
        for gid in routing.input_gids() {
            subscribers.entry(gid).or_default().push(thread);
        }

        let model = build_model(thread, thread % num_groups, thread / num_groups)?;
        let mut net_thread = NetThread::new(thread, routing, model.targets, model.state)?;
        net_thread.set_teps(params.threshold_teps);
        net_thread.set_exchange_interval(interval);
        for watch in model.watches {
            net_thread.add_watch(watch.target, watch.nrflag, watch.evaluator)?;
        }
        net_thread.init()?;
        threads.push(net_thread);
    }

    log::info!(
        "rank {}: {} threads, exchange interval {}, min delay {}",
        transport.rank(),
        num_threads,
        interval,
        min_delay
    );

    let num_workers = get_num_workers(&params).min(num_threads);
    let mut broadcast_tx = Bus::new(1);
    let (interval_tx, interval_rx) = mpsc_channel();
    let (spikes_tx, spikes_rx) = mpsc_channel();
    let (timings_tx, timings_rx) = mpsc_channel();

    let mut join_handles = Vec::new();
    for (worker_id, mut worker_threads) in util::split_for_workers(threads, num_workers)
        .into_iter()
        .enumerate()
    {
        let broadcast_rx = broadcast_tx.add_rx();
        let interval_tx = interval_tx.clone();
        let spikes_tx = spikes_tx.clone();
        let timings_tx = timings_tx.clone();
        let pin_threads = params.technical_params.pin_threads;

        join_handles.push(std::thread::spawn(move || {
            if pin_threads {
                let core_id = CoreId { id: worker_id };
                core_affinity::set_for_current(core_id);
            }

            net_thread::run(
                &mut worker_threads,
                broadcast_rx,
                interval_tx,
                spikes_tx,
                timings_tx,
            );
        }));
    }

    Ok(Simulation {
        num_threads,
        num_workers,
        t: 0.0,
        t_stop: params.t_stop,
        interval,
        next_boundary: interval,
        directory,
        transport,
        subscribers,
        netcon_counts,
        pending: vec![Vec::new(); num_threads],
        broadcast_tx: Some(broadcast_tx),
        interval_rx,
        spikes_rx,
        timings_rx,
        join_handles,
        netcon_deliveries: 0,
        spikes_exchanged: 0,
    })
}

fn get_num_workers(params: &SimParams) -> usize {
    params
        .technical_params
        .num_threads
        .unwrap_or_else(num_cpus::get)
}

fn choose_exchange_interval(requested: Option<f64>, min_delay: f64) -> SimResult<f64> {
    if min_delay <= 0.0 {
        return Err(SimpleError::new(
            "connections crossing threads need a strictly positive delay",
        )
        .into());
    }

    match requested {
        Some(interval) if interval > min_delay => Err(SimError::ExchangeIntervalTooLong {
            interval,
            min_delay,
        }),
        Some(interval) => Ok(interval),
        None if min_delay.is_finite() => Ok(min_delay),
        None => Ok(DEFAULT_EXCHANGE_INTERVAL),
    }
}

/// Coordinator of one rank. Drives the workers one exchange interval at a time and moves
/// spikes between threads and ranks at every interval boundary.
pub struct Simulation {
    num_threads: usize,
    num_workers: usize,
    t: f64,
    t_stop: f64,
    interval: f64,
    next_boundary: f64,
    directory: Arc<SourceDirectory>,
    transport: Box<dyn Transport>,
    subscribers: HashMap<Gid, Vec<usize>>,
    netcon_counts: Vec<usize>,
    pending: Vec<Vec<(Gid, f64)>>,
    broadcast_tx: Option<Bus<Request>>,
    interval_rx: MpscReceiver<SimResult<IntervalResult>>,
    spikes_rx: MpscReceiver<Vec<SpikeRecord>>,
    timings_rx: MpscReceiver<Vec<ThreadTiming>>,
    join_handles: Vec<JoinHandle<()>>,
    netcon_deliveries: usize,
    spikes_exchanged: usize,
}

impl Simulation {
    pub fn t(&self) -> f64 {
        self.t
    }

    pub fn t_stop(&self) -> f64 {
        self.t_stop
    }

    pub fn exchange_interval(&self) -> f64 {
        self.interval
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn directory(&self) -> Arc<SourceDirectory> {
        Arc::clone(&self.directory)
    }

    pub fn netcon_deliveries(&self) -> usize {
        self.netcon_deliveries
    }

    /// Spikes handed to the transport by this rank so far.
    pub fn spikes_exchanged(&self) -> usize {
        self.spikes_exchanged
    }

    /// Feeds an external spike of `gid` at `t` to every thread listening to it. It is
    /// dispatched at the start of the next interval. Gids simulated on this rank cannot be
    /// injected.
    pub fn inject(&mut self, gid: Gid, t: f64) -> SimResult<()> {
        match self.directory.locate(gid) {
            Some(SourceLocation::External) | Some(SourceLocation::Remote { .. }) => {}
            Some(SourceLocation::Local { .. }) | None => {
                return Err(SimError::UnknownInput { gid })
            }
        }
        if t < self.t {
            return Err(SimError::InvalidDeliveryTime { t, now: self.t });
        }

        self.route(gid, t);
        Ok(())
    }

    pub fn set_netcon_active(&mut self, thread: usize, netcon: usize, active: bool) -> SimResult<()> {
        match self.netcon_counts.get(thread) {
            Some(count) if netcon < *count => {}
            _ => return Err(SimError::UnknownNetCon { thread, netcon }),
        }

        self.broadcast(Request::SetActive {
            thread,
            netcon,
            active,
        })
    }

    /// Runs one exchange interval, or up to `t_stop` if that comes first. Returns whether there
    /// is time left to simulate.
    pub fn run_interval(&mut self) -> SimResult<bool> {
        if self.t >= self.t_stop {
            return Ok(false);
        }

        let stopped = self.advance(self.t_stop)?;
        Ok(!stopped && self.t < self.t_stop)
    }

    pub fn run(&mut self) -> SimResult<()> {
        self.run_until(self.t_stop)
    }

    pub fn run_until(&mut self, t: f64) -> SimResult<()> {
        while self.t < t {
            if self.advance(t)? {
                break;
            }
        }
        Ok(())
    }

    pub fn spike_raster(&mut self) -> SimResult<SpikeRaster> {
        self.broadcast(Request::CollectSpikes)?;

        let mut logs = Vec::with_capacity(self.num_workers);
        for worker in 0..self.num_workers {
            logs.push(
                self.spikes_rx
                    .recv()
                    .map_err(|_| SimError::WorkerDisconnected { worker })?,
            );
        }

        Ok(SpikeRaster::merge(logs))
    }

    pub fn timings(&mut self) -> SimResult<Vec<ThreadTiming>> {
        self.broadcast(Request::CollectTimings)?;

        let mut timings = Vec::with_capacity(self.num_threads);
        for worker in 0..self.num_workers {
            timings.extend(
                self.timings_rx
                    .recv()
                    .map_err(|_| SimError::WorkerDisconnected { worker })?,
            );
        }
        timings.sort_by_key(|timing| timing.thread);

        Ok(timings)
    }

    /// One interval ending at the next exchange boundary or `t_target`, whichever is earlier.
    /// Returns true if a thread delivered a stop request.
    fn advance(&mut self, t_target: f64) -> SimResult<bool> {
        let t_end = self.next_boundary.min(t_target);
        if t_end >= self.next_boundary {
            self.next_boundary += self.interval;
        }

        let incoming = std::mem::replace(&mut self.pending, vec![Vec::new(); self.num_threads]);
        self.broadcast(Request::Interval {
            t_end,
            incoming: Arc::new(incoming),
        })?;

        let mut outgoing: Vec<OutputSpike> = Vec::new();
        let mut stopped = false;
        let mut first_error = None;
        for worker in 0..self.num_workers {
            match self.interval_rx.recv() {
                Ok(Ok(result)) => {
                    outgoing.extend(result.outgoing);
                    self.netcon_deliveries += result.netcon_deliveries;
                    stopped |= result.stopped;
                }
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(_) => return Err(SimError::WorkerDisconnected { worker }),
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        self.exchange(outgoing)?;
        self.t = t_end;

        if stopped {
            log::info!("stop requested, simulation halted at t={}", self.t);
        }
        Ok(stopped)
    }

    fn exchange(&mut self, mut outgoing: Vec<OutputSpike>) -> SimResult<()> {
        outgoing.sort_by(|a, b| a.t.total_cmp(&b.t).then(a.gid.cmp(&b.gid)));

        let wire: Vec<WireSpike> = outgoing
            .iter()
            .map(|spike| self.directory.encode(spike))
            .collect();
        let received = self.transport.exchange(&wire)?;
        self.spikes_exchanged += wire.len();

        for spike in &outgoing {
            self.route(spike.gid, spike.t);
        }

        for (rank, spikes) in received {
            for spike in &spikes {
                let gid = self.directory.decode(rank, spike)?;
                self.route(gid, spike.t);
            }
        }

        for spikes in self.pending.iter_mut() {
            spikes.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        }

        log::trace!(
            "t={}: exchanged {} local spikes, {} pending deliveries",
            self.t,
            wire.len(),
            self.pending.iter().map(Vec::len).sum::<usize>()
        );

        Ok(())
    }

    fn route(&mut self, gid: Gid, t: f64) {
        if let Some(threads) = self.subscribers.get(&gid) {
            for thread in threads {
                self.pending[*thread].push((gid, t));
            }
        }
    }

    fn broadcast(&mut self, request: Request) -> SimResult<()> {
        match self.broadcast_tx.as_mut() {
            Some(broadcast_tx) => {
                broadcast_tx.broadcast(request);
                Ok(())
            }
            None => Err(SimError::WorkerDisconnected { worker: 0 }),
        }
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        drop(self.broadcast_tx.take()); // signals the workers to exit their loops

        self.join_handles.drain(..).for_each(|join_handle| {
            join_handle.join().ok();
        });
    }
}
