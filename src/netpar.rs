use std::time::Duration;

use crate::event::Event;
use crate::queue::{EventQueue, QueueHandle};

/// Per-thread exchange tick. Its delivery closes a coordination interval; `wx` accumulates the
/// time spent waiting for the exchange and `ws` the time spent handing received spikes to
/// input sources, both in seconds.
#[derive(Debug, Clone)]
pub struct NetParEvent {
    ithread: usize,
    interval: f64,
    armed: bool,
    intervals: usize,
    wx: f64,
    ws: f64,
}

impl NetParEvent {
    pub fn new(ithread: usize, interval: f64) -> Self {
        Self {
            ithread,
            interval,
            armed: false,
            intervals: 0,
            wx: 0.0,
            ws: 0.0,
        }
    }

    pub fn ithread(&self) -> usize {
        self.ithread
    }

    pub fn interval(&self) -> f64 {
        self.interval
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn intervals(&self) -> usize {
        self.intervals
    }

    pub fn wx(&self) -> f64 {
        self.wx
    }

    pub fn ws(&self) -> f64 {
        self.ws
    }

    pub fn send(&mut self, t: f64, queue: &mut EventQueue<Event>) -> QueueHandle {
        self.armed = true;
        queue.insert(t + self.interval, Event::NetPar)
    }

    pub fn deliver(&mut self, t: f64) {
        log::trace!("thread {}: exchange boundary at t={}", self.ithread, t);
        self.armed = false;
        self.intervals += 1;
    }

    pub fn record_exchange(&mut self, elapsed: Duration) {
        self.wx += elapsed.as_secs_f64();
    }

    pub fn record_spike_dispatch(&mut self, elapsed: Duration) {
        self.ws += elapsed.as_secs_f64();
    }
}
