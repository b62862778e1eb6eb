use std::time::Duration;

use simple_error::SimpleError;
use thiserror::Error;

use crate::types::Gid;

pub type SimResult<T> = Result<T, SimError>;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("thread {thread}: no local or remote source for gid {gid}")]
    UnresolvedSource { thread: usize, gid: Gid },

    #[error("invalid delivery time {t} (thread time is {now})")]
    InvalidDeliveryTime { t: f64, now: f64 },

    #[error("gid {gid} is defined more than once")]
    DuplicateGid { gid: Gid },

    #[error("gid {gid} does not fit into gid space {gid_space}")]
    GidOutOfRange { gid: Gid, gid_space: Gid },

    #[error("thread {thread}: invalid population data: {reason}")]
    InvalidPopulation { thread: usize, reason: String },

    #[error("invalid parameters: {0}")]
    InvalidParams(#[from] SimpleError),

    #[error("thread {thread} cannot queue an event owned by thread {owner}")]
    ForeignEvent { thread: usize, owner: usize },

    #[error("thread {thread} has no connection {netcon}")]
    UnknownNetCon { thread: usize, netcon: usize },

    #[error("queue handle does not refer to a pending self event")]
    StaleHandle,

    #[error("exchange interval {interval} exceeds minimum delay {min_delay}")]
    ExchangeIntervalTooLong { interval: f64, min_delay: f64 },

    #[error("spike from rank {rank} carries unknown source id {id}")]
    UnknownRemoteSpike { rank: usize, id: i64 },

    #[error("gid {gid} is not an input fed from outside this rank")]
    UnknownInput { gid: Gid },

    #[error("worker for simulation thread group {worker} terminated")]
    WorkerDisconnected { worker: usize },

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("malformed population data: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("malformed configuration: {0}")]
    Config(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("exchange timed out after {0:?}")]
    Timeout(Duration),

    #[error("peer rank {0} disconnected")]
    Disconnected(usize),

    #[error("unexpected message from rank {0}")]
    Protocol(usize),
}
