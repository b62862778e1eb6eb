use std::fmt;

use crate::types::TargetId;

/// Upward zero-crossing detector. `flag` is true while the observed value is at or below zero;
/// a crossing is reported only on the transition to strictly positive.
#[derive(Debug, Clone, Copy)]
pub struct ConditionEvent {
    flag: bool,
    last_value: Option<f64>,
}

impl Default for ConditionEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionEvent {
    pub fn new() -> Self {
        Self {
            flag: true,
            last_value: None,
        }
    }

    /// Seeds the detector so that a value already above zero at startup does not fire.
    pub fn init(&mut self, value: f64) {
        self.flag = value <= 0.0;
        self.last_value = Some(value);
    }

    pub fn is_below(&self) -> bool {
        self.flag
    }

    pub fn check(&mut self, value: f64, t: f64, teps: f64) -> Option<f64> {
        self.last_value = Some(value);

        if value > 0.0 {
            if self.flag {
                self.flag = false;
                return Some(t + teps);
            }
        } else {
            self.flag = true;
        }

        None
    }

    /// Same as `check`, but places the crossing on the straight line between the previous
    /// observation at `t - dt` and the current one at `t`.
    pub fn check_interpolated(&mut self, value: f64, t: f64, dt: f64, teps: f64) -> Option<f64> {
        let previous = self.last_value;

        self.check(value, t, 0.0).map(|t_step| match previous {
            Some(previous) if previous <= 0.0 && dt > 0.0 => {
                let fraction = value / (value - previous);
                t - dt * fraction + teps
            }
            _ => t_step + teps,
        })
    }
}

pub type WatchFn = fn(TargetId, &[f64]) -> f64;

/// User-defined condition owned by a target. On an upward crossing the target receives an event
/// carrying `nrflag`.
#[derive(Clone)]
pub struct WatchCondition {
    pub(crate) target: TargetId,
    pub(crate) nrflag: f64,
    evaluator: WatchFn,
    condition: ConditionEvent,
}

impl fmt::Debug for WatchCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchCondition")
            .field("target", &self.target)
            .field("nrflag", &self.nrflag)
            .field("condition", &self.condition)
            .finish()
    }
}

impl WatchCondition {
    pub fn new(target: TargetId, nrflag: f64, evaluator: WatchFn) -> Self {
        Self {
            target,
            nrflag,
            evaluator,
            condition: ConditionEvent::new(),
        }
    }

    pub fn target(&self) -> TargetId {
        self.target
    }

    pub fn nrflag(&self) -> f64 {
        self.nrflag
    }

    pub fn value(&self, state: &[f64]) -> f64 {
        (self.evaluator)(self.target, state)
    }

    pub fn init(&mut self, state: &[f64]) {
        let value = self.value(state);
        self.condition.init(value);
    }

    pub fn check(&mut self, state: &[f64], t: f64, teps: f64) -> Option<f64> {
        let value = self.value(state);
        self.condition.check(value, t, teps)
    }

    pub fn is_below(&self) -> bool {
        self.condition.is_below()
    }
}
