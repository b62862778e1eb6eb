use std::fmt::Debug;

use crate::error::{SimError, SimResult};
use crate::event::{Event, SelfEvent};
use crate::queue::{EventQueue, QueueHandle};
use crate::types::TargetId;

/// A model instance that can receive events. Numeric state the instance wants observed by
/// threshold detectors lives in the thread's state array.
pub trait PointProcess: Debug + Send {
    fn init(&mut self, _ctx: &mut NetReceiveContext<'_>) -> SimResult<()> {
        Ok(())
    }

    fn net_receive(
        &mut self,
        ctx: &mut NetReceiveContext<'_>,
        weights: &mut [f64],
        flag: f64,
    ) -> SimResult<()>;
}

/// What a target may do while handling an event: read and write thread state, schedule, move
/// or cancel its own self events, and emit spikes through its source.
pub struct NetReceiveContext<'a> {
    t: f64,
    target: TargetId,
    weight: Option<usize>,
    queue: &'a mut EventQueue<Event>,
    state: &'a mut [f64],
    touched: &'a mut Vec<usize>,
    net_events: &'a mut Vec<f64>,
}

impl<'a> NetReceiveContext<'a> {
    pub(crate) fn new(
        t: f64,
        target: TargetId,
        weight: Option<usize>,
        queue: &'a mut EventQueue<Event>,
        state: &'a mut [f64],
        touched: &'a mut Vec<usize>,
        net_events: &'a mut Vec<f64>,
    ) -> Self {
        Self {
            t,
            target,
            weight,
            queue,
            state,
            touched,
            net_events,
        }
    }

    pub fn t(&self) -> f64 {
        self.t
    }

    pub fn target(&self) -> TargetId {
        self.target
    }

    pub fn state(&self, index: usize) -> f64 {
        self.state[index]
    }

    pub fn set_state(&mut self, index: usize, value: f64) {
        self.state[index] = value;
        self.touched.push(index);
    }

    pub fn add_to_state(&mut self, index: usize, value: f64) {
        self.state[index] += value;
        self.touched.push(index);
    }

    /// Schedules a self event `delay` from now. The returned handle is the movable reference the
    /// target keeps to relocate or cancel the event before it fires.
    pub fn net_send(&mut self, delay: f64, flag: f64) -> SimResult<QueueHandle> {
        if !(delay >= 0.0) {
            return Err(SimError::InvalidDeliveryTime {
                t: self.t + delay,
                now: self.t,
            });
        }

        let self_event = SelfEvent {
            target: self.target,
            flag,
            weight: self.weight,
        };

        Ok(self_event.send(self.t + delay, self.queue))
    }

    pub fn net_move(&mut self, handle: QueueHandle, t: f64) -> SimResult<()> {
        self.own_self_event(handle)?;

        if t < self.t {
            return Err(SimError::InvalidDeliveryTime { t, now: self.t });
        }

        self.queue.update(handle, t);
        Ok(())
    }

    pub fn net_cancel(&mut self, handle: QueueHandle) -> SimResult<()> {
        self.own_self_event(handle)?;
        self.queue.remove(handle);
        Ok(())
    }

    /// Emits a spike from this target's source at `t`, which must not lie in the past.
    pub fn net_event(&mut self, t: f64) -> SimResult<()> {
        if t < self.t {
            return Err(SimError::InvalidDeliveryTime { t, now: self.t });
        }

        self.net_events.push(t);
        Ok(())
    }

    fn own_self_event(&self, handle: QueueHandle) -> SimResult<()> {
        match self.queue.get(handle) {
            Some((_, Event::SelfEvent(self_event))) if self_event.target == self.target => Ok(()),
            _ => Err(SimError::StaleHandle),
        }
    }
}

/// Adds the first weight of every received connection event to one state variable. With a
/// `fire_threshold` it behaves as an artificial integrate-and-fire cell: reaching the threshold
/// emits a spike and resets the variable to zero.
#[derive(Debug, Clone)]
pub struct Accumulator {
    pub state_index: usize,
    pub fire_threshold: Option<f64>,
    pub received: usize,
}

impl Accumulator {
    pub fn new(state_index: usize) -> Self {
        Self {
            state_index,
            fire_threshold: None,
            received: 0,
        }
    }

    pub fn firing(state_index: usize, fire_threshold: f64) -> Self {
        Self {
            state_index,
            fire_threshold: Some(fire_threshold),
            received: 0,
        }
    }
}

impl PointProcess for Accumulator {
    fn net_receive(
        &mut self,
        ctx: &mut NetReceiveContext<'_>,
        weights: &mut [f64],
        _flag: f64,
    ) -> SimResult<()> {
        self.received += 1;

        if let Some(weight) = weights.first() {
            ctx.add_to_state(self.state_index, *weight);
        }

        if let Some(fire_threshold) = self.fire_threshold {
            if ctx.state(self.state_index) >= fire_threshold {
                ctx.set_state(self.state_index, 0.0);
                ctx.net_event(ctx.t())?;
            }
        }

        Ok(())
    }
}

const GENERATOR_TICK: f64 = 1.0;

/// Regular spike train: `number` spikes, `interval` apart, the first at `start`. Driven by its
/// own self events; an incoming connection event with a positive weight fires an extra spike
/// immediately.
#[derive(Debug, Clone)]
pub struct SpikeGenerator {
    pub start: f64,
    pub interval: f64,
    pub number: usize,
    emitted: usize,
    pending: Option<QueueHandle>,
}

impl SpikeGenerator {
    pub fn new(start: f64, interval: f64, number: usize) -> Self {
        Self {
            start,
            interval,
            number,
            emitted: 0,
            pending: None,
        }
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub fn pending(&self) -> Option<QueueHandle> {
        self.pending
    }

    /// Moves the next scheduled spike to `t`.
    pub fn reschedule(&mut self, ctx: &mut NetReceiveContext<'_>, t: f64) -> SimResult<()> {
        match self.pending {
            Some(handle) => ctx.net_move(handle, t),
            None => Err(SimError::StaleHandle),
        }
    }

    pub fn stop(&mut self, ctx: &mut NetReceiveContext<'_>) -> SimResult<()> {
        if let Some(handle) = self.pending.take() {
            ctx.net_cancel(handle)?;
        }
        Ok(())
    }
}

impl PointProcess for SpikeGenerator {
    fn init(&mut self, ctx: &mut NetReceiveContext<'_>) -> SimResult<()> {
        self.emitted = 0;
        if self.number > 0 {
            let delay = (self.start - ctx.t()).max(0.0);
            self.pending = Some(ctx.net_send(delay, GENERATOR_TICK)?);
        }
        Ok(())
    }

    fn net_receive(
        &mut self,
        ctx: &mut NetReceiveContext<'_>,
        weights: &mut [f64],
        flag: f64,
    ) -> SimResult<()> {
        if flag == GENERATOR_TICK {
            self.pending = None;
            self.emitted += 1;
            ctx.net_event(ctx.t())?;

            if self.emitted < self.number {
                self.pending = Some(ctx.net_send(self.interval, GENERATOR_TICK)?);
            }
        } else if weights.first().map_or(false, |weight| *weight > 0.0) {
            ctx.net_event(ctx.t())?;
        }

        Ok(())
    }
}
