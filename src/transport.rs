use std::sync::Arc;
use std::time::Duration;

use bus::{Bus, BusReader};
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::params::TechnicalParams;
use crate::types::Gid;

/// Identifier of a spike on the wire: the sender's compressed one-byte output ordinal when
/// every rank has few enough outputs, the full gid otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpikeId {
    Compressed(u8),
    Gid(Gid),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WireSpike {
    pub id: SpikeId,
    pub t: f64,
}

/// Collective operations between ranks. Every rank calls each operation the same number of
/// times in the same order.
pub trait Transport: Send {
    fn rank(&self) -> usize;

    fn num_ranks(&self) -> usize;

    /// Gathers every rank's output gids, indexed by rank.
    fn allgather_gids(&mut self, local: &[Gid]) -> Result<Vec<Vec<Gid>>, TransportError>;

    fn allreduce_min(&mut self, value: f64) -> Result<f64, TransportError>;

    /// Sends this rank's spikes of the finished interval to every other rank and returns what
    /// the others sent, tagged with the sending rank.
    fn exchange(
        &mut self,
        outgoing: &[WireSpike],
    ) -> Result<Vec<(usize, Vec<WireSpike>)>, TransportError>;
}

/// The transport of a single-process run.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalTransport;

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        0
    }

    fn num_ranks(&self) -> usize {
        1
    }

    fn allgather_gids(&mut self, local: &[Gid]) -> Result<Vec<Vec<Gid>>, TransportError> {
        Ok(vec![local.to_vec()])
    }

    fn allreduce_min(&mut self, value: f64) -> Result<f64, TransportError> {
        Ok(value)
    }

    fn exchange(
        &mut self,
        _outgoing: &[WireSpike],
    ) -> Result<Vec<(usize, Vec<WireSpike>)>, TransportError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone)]
enum Payload {
    Gids(Vec<Gid>),
    Min(f64),
    Spikes(Vec<WireSpike>),
}

#[derive(Debug)]
struct Packet {
    round: u64,
    payload: Payload,
}

/// Ranks living in one process, e.g. one per OS thread. Each rank broadcasts on its own bus
/// and holds a reader on every other rank's bus.
pub struct BusTransport {
    rank: usize,
    num_ranks: usize,
    timeout: Duration,
    round: u64,
    tx: Bus<Arc<Packet>>,
    rxs: Vec<(usize, BusReader<Arc<Packet>>)>,
}

/// Creates the connected transports of `num_ranks` in-process ranks, indexed by rank. Every
/// collective waits at most `exchange_timeout_ms` for each peer.
pub fn bus_transport_group(
    num_ranks: usize,
    technical_params: &TechnicalParams,
) -> Vec<BusTransport> {
    let timeout = technical_params.exchange_timeout();
    let mut buses: Vec<Bus<Arc<Packet>>> = (0..num_ranks).map(|_| Bus::new(4)).collect();

    let mut readers: Vec<Vec<(usize, BusReader<Arc<Packet>>)>> =
        (0..num_ranks).map(|_| Vec::new()).collect();
    for (sender, bus) in buses.iter_mut().enumerate() {
        for (receiver, receiver_readers) in readers.iter_mut().enumerate() {
            if receiver != sender {
                receiver_readers.push((sender, bus.add_rx()));
            }
        }
    }

    buses
        .into_iter()
        .zip(readers)
        .enumerate()
        .map(|(rank, (tx, rxs))| BusTransport {
            rank,
            num_ranks,
            timeout,
            round: 0,
            tx,
            rxs,
        })
        .collect()
}

impl BusTransport {
    fn collective(&mut self, payload: Payload) -> Result<Vec<(usize, Payload)>, TransportError> {
        let round = self.round;
        self.round += 1;

        self.tx.broadcast(Arc::new(Packet { round, payload }));

        let mut received = Vec::with_capacity(self.rxs.len());
        for (sender, rx) in self.rxs.iter_mut() {
            let packet = rx.recv_timeout(self.timeout).map_err(|err| match err {
                std::sync::mpsc::RecvTimeoutError::Timeout => TransportError::Timeout(self.timeout),
                std::sync::mpsc::RecvTimeoutError::Disconnected => {
                    TransportError::Disconnected(*sender)
                }
            })?;

            if packet.round != round {
                return Err(TransportError::Protocol(*sender));
            }
            received.push((*sender, packet.payload.clone()));
        }

        Ok(received)
    }
}

impl Transport for BusTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    fn allgather_gids(&mut self, local: &[Gid]) -> Result<Vec<Vec<Gid>>, TransportError> {
        let mut gathered = vec![Vec::new(); self.num_ranks];
        gathered[self.rank] = local.to_vec();

        for (sender, payload) in self.collective(Payload::Gids(local.to_vec()))? {
            match payload {
                Payload::Gids(gids) => gathered[sender] = gids,
                _ => return Err(TransportError::Protocol(sender)),
            }
        }

        Ok(gathered)
    }

    fn allreduce_min(&mut self, value: f64) -> Result<f64, TransportError> {
        let mut min = value;
        for (sender, payload) in self.collective(Payload::Min(value))? {
            match payload {
                Payload::Min(other) => min = min.min(other),
                _ => return Err(TransportError::Protocol(sender)),
            }
        }
        Ok(min)
    }

    fn exchange(
        &mut self,
        outgoing: &[WireSpike],
    ) -> Result<Vec<(usize, Vec<WireSpike>)>, TransportError> {
        self.collective(Payload::Spikes(outgoing.to_vec()))?
            .into_iter()
            .map(|(sender, payload)| match payload {
                Payload::Spikes(spikes) => Ok((sender, spikes)),
                _ => Err(TransportError::Protocol(sender)),
            })
            .collect()
    }
}
