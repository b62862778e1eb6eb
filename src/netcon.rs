use std::ops::Range;

use crate::event::Event;
use crate::queue::{EventQueue, QueueHandle};
use crate::types::TargetId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceRef {
    PreSyn(usize),
    InputPreSyn(usize),
}

/// Resolved connection. The weights live in the owning thread's flat weight array; only the
/// loader can build one, after the source gid has been resolved into a `SourceRef`.
#[derive(Debug, Clone)]
pub struct NetCon {
    pub(crate) active: bool,
    pub(crate) delay: f64,
    pub(crate) target: Option<TargetId>,
    pub(crate) source: Option<SourceRef>,
    pub(crate) weight_index: usize,
    pub(crate) weight_cnt: usize,
}

impl NetCon {
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn delay(&self) -> f64 {
        self.delay
    }

    pub fn target(&self) -> Option<TargetId> {
        self.target
    }

    pub fn source(&self) -> Option<SourceRef> {
        self.source
    }

    pub fn weight_range(&self) -> Range<usize> {
        self.weight_index..self.weight_index + self.weight_cnt
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub(crate) fn is_deliverable(&self) -> bool {
        self.active && self.target.is_some()
    }

    /// Schedules arrival at the target, `delay` after the source fired at `t`.
    pub fn send(&self, netcon_id: usize, t: f64, queue: &mut EventQueue<Event>) -> QueueHandle {
        queue.insert(t + self.delay, Event::NetCon(netcon_id))
    }
}
