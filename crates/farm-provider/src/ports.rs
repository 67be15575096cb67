/// Port pool.
///
/// A bounded range of TCP ports handed out to workers in fixed-size
/// blocks. Only the supervisor loop touches the pool, so it needs no
/// locking of its own.
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Ports every worker gets: screen stream, remote connect, VNC, MJPEG.
pub const PORTS_PER_WORKER: usize = 4;

/// The ports reserved for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerPorts {
    pub screen: u16,
    pub connect: u16,
    pub vnc: u16,
    pub mjpeg: u16,
}

impl WorkerPorts {
    pub fn to_array(self) -> [u16; PORTS_PER_WORKER] {
        [self.screen, self.connect, self.vnc, self.mjpeg]
    }

    fn from_array([screen, connect, vnc, mjpeg]: [u16; PORTS_PER_WORKER]) -> Self {
        Self {
            screen,
            connect,
            vnc,
            mjpeg,
        }
    }

    /// All four ports distinct and non-zero.
    pub fn is_valid(&self) -> bool {
        let ports = self.to_array();
        let unique: BTreeSet<u16> = ports.iter().copied().collect();
        unique.len() == PORTS_PER_WORKER && !unique.contains(&0)
    }
}

#[derive(Debug)]
pub struct PortPool {
    min: u16,
    max: u16,
    free: BTreeSet<u16>,
    in_use: BTreeSet<u16>,
}

impl PortPool {
    /// Pool over `min..=max`.
    pub fn new(min: u16, max: u16) -> Result<Self, ProviderError> {
        if min == 0 || min > max {
            return Err(ProviderError::InvalidPortRange { min, max });
        }
        Ok(Self {
            min,
            max,
            free: (min..=max).collect(),
            in_use: BTreeSet::new(),
        })
    }

    /// Take the next block: the lowest free ports, including ones
    /// released earlier.
    pub fn reserve(&mut self) -> Result<WorkerPorts, ProviderError> {
        if self.free.len() < PORTS_PER_WORKER {
            return Err(ProviderError::PoolExhausted {
                needed: PORTS_PER_WORKER,
                available: self.free.len(),
            });
        }
        let mut block = [0u16; PORTS_PER_WORKER];
        for slot in block.iter_mut() {
            // Length checked above.
            *slot = self.free.pop_first().unwrap_or_default();
            self.in_use.insert(*slot);
        }
        Ok(WorkerPorts::from_array(block))
    }

    /// Return a block. Ports not currently reserved are ignored, so a
    /// double release cannot grow the pool.
    pub fn release(&mut self, ports: &WorkerPorts) {
        for port in ports.to_array() {
            if self.in_use.remove(&port) {
                self.free.insert(port);
            } else {
                tracing::warn!("port {port} released but not reserved");
            }
        }
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }

    /// Whole blocks that can still be reserved.
    pub fn blocks_available(&self) -> usize {
        self.free.len() / PORTS_PER_WORKER
    }

    pub fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }
}
