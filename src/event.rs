use serde::{Deserialize, Serialize};

use crate::queue::{EventQueue, QueueHandle};
use crate::types::TargetId;

/// The fixed set of event kinds. The numeric codes are the ones used in diagnostic output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Discrete,
    Tstop,
    NetCon,
    SelfEvent,
    PreSyn,
    NetParEvent,
    InputPreSyn,
}

impl EventKind {
    pub fn code(self) -> i32 {
        match self {
            EventKind::Discrete => 0,
            EventKind::Tstop => 1,
            EventKind::NetCon => 2,
            EventKind::SelfEvent => 3,
            EventKind::PreSyn => 4,
            EventKind::NetParEvent => 7,
            EventKind::InputPreSyn => 20,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(EventKind::Discrete),
            1 => Some(EventKind::Tstop),
            2 => Some(EventKind::NetCon),
            3 => Some(EventKind::SelfEvent),
            4 => Some(EventKind::PreSyn),
            7 => Some(EventKind::NetParEvent),
            20 => Some(EventKind::InputPreSyn),
            _ => None,
        }
    }
}

/// A queued event. Indices refer to the owning thread's arenas: `NetCon` into its connection
/// array, `PreSyn`/`InputPreSyn` into its source arrays, `Discrete` optionally into its watch
/// conditions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event {
    Discrete(Option<usize>),
    Tstop,
    NetCon(usize),
    SelfEvent(SelfEvent),
    PreSyn(usize),
    NetPar,
    InputPreSyn(usize),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Discrete(_) => EventKind::Discrete,
            Event::Tstop => EventKind::Tstop,
            Event::NetCon(_) => EventKind::NetCon,
            Event::SelfEvent(_) => EventKind::SelfEvent,
            Event::PreSyn(_) => EventKind::PreSyn,
            Event::NetPar => EventKind::NetParEvent,
            Event::InputPreSyn(_) => EventKind::InputPreSyn,
        }
    }

    /// Only self events hand out movable handles to their owner.
    pub fn is_movable(&self) -> bool {
        matches!(self, Event::SelfEvent(_))
    }
}

/// Callback a target schedules for itself. The `weight` names the connection whose weights are
/// handed back on delivery, if the event was scheduled while handling that connection's event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelfEvent {
    pub target: TargetId,
    pub flag: f64,
    pub weight: Option<usize>,
}

impl SelfEvent {
    pub fn send(self, t: f64, queue: &mut EventQueue<Event>) -> QueueHandle {
        queue.insert(t, Event::SelfEvent(self))
    }
}
