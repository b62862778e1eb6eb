use std::time::Duration;

use serde::{Deserialize, Serialize};
use simple_error::SimpleError;

use crate::error::SimResult;
use crate::types::Gid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimParams {
    pub t_stop: f64,
    /// Defaults to the minimum delay of all connections fed by the exchange.
    pub exchange_interval: Option<f64>,
    pub gid_space: Gid,
    pub num_replicas: usize,
    pub extracon: usize,
    pub threshold_teps: f64,
    pub compress_spikes: bool,
    pub technical_params: TechnicalParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalParams {
    pub num_threads: Option<usize>,
    pub pin_threads: bool,
    pub exchange_timeout_ms: u64,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            t_stop: 100.0,
            exchange_interval: None,
            gid_space: 1_000_000,
            num_replicas: 1,
            extracon: 0,
            threshold_teps: 0.0,
            compress_spikes: false,
            technical_params: TechnicalParams::default(),
        }
    }
}

impl Default for TechnicalParams {
    fn default() -> Self {
        Self {
            num_threads: Some(1),
            pin_threads: false,
            exchange_timeout_ms: 10_000,
        }
    }
}

impl TechnicalParams {
    /// How long a rank waits for its peers in one collective before giving up.
    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }
}

impl SimParams {
    pub fn from_yaml(yaml: &str) -> SimResult<Self> {
        let params: SimParams = serde_yaml::from_str(yaml)?;
        validate_sim_params(&params)?;
        Ok(params)
    }
}

pub fn validate_sim_params(params: &SimParams) -> Result<(), SimpleError> {
    if !(params.t_stop >= 0.0) {
        return Err(SimpleError::new("t_stop must not be negative"));
    }

    if let Some(exchange_interval) = params.exchange_interval {
        if !(exchange_interval > 0.0) || !exchange_interval.is_finite() {
            return Err(SimpleError::new(
                "exchange_interval must be strictly positive and finite",
            ));
        }
    }

    if params.gid_space <= 0 {
        return Err(SimpleError::new("gid_space must be strictly positive"));
    }

    if params.num_replicas == 0 {
        return Err(SimpleError::new("num_replicas must be at least 1"));
    }

    let required_gid_range = params.num_replicas as i64 * params.gid_space as i64;
    if required_gid_range > Gid::MAX as i64 + 1 {
        return Err(SimpleError::new(format!(
            "{} replicas of gid_space {} exceed the gid range",
            params.num_replicas, params.gid_space
        )));
    }

    if !(params.threshold_teps >= 0.0) {
        return Err(SimpleError::new("threshold_teps must not be negative"));
    }

    validate_technical_params(&params.technical_params)?;

    Ok(())
}

fn validate_technical_params(technical_params: &TechnicalParams) -> Result<(), SimpleError> {
    if let Some(num_threads) = technical_params.num_threads {
        if num_threads == 0 {
            return Err(SimpleError::new("num_threads must be strictly positive"));
        }

        if num_cpus::get() < num_threads {
            return Err(SimpleError::new(
                "num_threads must not be greater than number of available CPUs",
            ));
        }
    }

    if technical_params.exchange_timeout_ms == 0 {
        return Err(SimpleError::new(
            "exchange_timeout_ms must be strictly positive",
        ));
    }

    Ok(())
}
