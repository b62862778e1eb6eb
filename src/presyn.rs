use std::ops::Range;

use crate::condition::ConditionEvent;
use crate::types::{Gid, TargetId};

/// Spike source simulated on this thread. Its listeners are the `nc_cnt` entries starting at
/// `nc_index` in the thread's source-ordered connection table.
#[derive(Debug, Clone)]
pub struct PreSyn {
    pub(crate) gid: Gid,
    pub(crate) threshold: f64,
    pub(crate) thvar: Option<usize>,
    pub(crate) pntsrc: Option<TargetId>,
    pub(crate) nc_index: usize,
    pub(crate) nc_cnt: usize,
    pub(crate) output_index: Option<u32>,
    pub(crate) localgid: u8,
    pub(crate) condition: ConditionEvent,
}

impl PreSyn {
    pub fn gid(&self) -> Gid {
        self.gid
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn thvar(&self) -> Option<usize> {
        self.thvar
    }

    pub fn pntsrc(&self) -> Option<TargetId> {
        self.pntsrc
    }

    pub fn output_index(&self) -> Option<u32> {
        self.output_index
    }

    pub fn localgid(&self) -> u8 {
        self.localgid
    }

    pub fn listener_range(&self) -> Range<usize> {
        self.nc_index..self.nc_index + self.nc_cnt
    }

    /// Monitored state minus threshold; `None` for artificial sources.
    pub fn value(&self, state: &[f64]) -> Option<f64> {
        self.thvar.map(|thvar| state[thvar] - self.threshold)
    }
}

/// Routing anchor for a source whose spikes arrive through the exchange.
#[derive(Debug, Clone)]
pub struct InputPreSyn {
    pub(crate) gid: Gid,
    pub(crate) nc_index: usize,
    pub(crate) nc_cnt: usize,
}

impl InputPreSyn {
    pub fn gid(&self) -> Gid {
        self.gid
    }

    pub fn listener_range(&self) -> Range<usize> {
        self.nc_index..self.nc_index + self.nc_cnt
    }
}

/// A spike leaving the thread through the exchange.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputSpike {
    pub gid: Gid,
    pub output_index: u32,
    pub localgid: u8,
    pub t: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn value_relative_to_threshold() {
        let sut = PreSyn {
            gid: 5,
            threshold: -20.0,
            thvar: Some(1),
            pntsrc: None,
            nc_index: 4,
            nc_cnt: 3,
            output_index: Some(0),
            localgid: 0,
            condition: ConditionEvent::new(),
        };

        assert_approx_eq!(f64, sut.value(&[0.0, -25.0]).unwrap(), -5.0);
        assert_eq!(sut.listener_range(), 4..7);
    }

    #[test]
    fn artificial_source_has_no_value() {
        let sut = PreSyn {
            gid: -1,
            threshold: 0.0,
            thvar: None,
            pntsrc: Some(TargetId::new(0, 2)),
            nc_index: 0,
            nc_cnt: 0,
            output_index: None,
            localgid: 0,
            condition: ConditionEvent::new(),
        };

        assert_eq!(sut.value(&[1.0]), None);
        assert!(sut.listener_range().is_empty());
    }
}
