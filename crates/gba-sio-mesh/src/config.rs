use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use gba_sio_mesh_utils::ThreadPriority;

use crate::cycles::Cycles;

/// Cycle cost of one transfer round, indexed `[baud][connected - 1]`,
/// mirroring the host core's `GBASIOCyclesPerTransfer` table. Read once at
/// transfer setup; changes mid-transfer are ignored until the next round.
#[derive(Debug, Clone, Copy)]
pub struct CyclesPerTransfer(pub [[i32; 4]; 4]);

impl CyclesPerTransfer {
    pub fn lookup(&self, baud: u16, connected: u8) -> Cycles {
        let baud = (baud as usize).min(3);
        let idx = (connected.max(1) - 1) as usize;
        Cycles(self.0[baud][idx.min(3)])
    }
}

/// Constructor-time options (§6): listening port, bind/public addresses,
/// the cycles-per-transfer table supplied by the host core, and an
/// optional thread-tuning hint for the emulator/network worker threads.
///
/// `serde`-(de)serializable so a host can load it from the same config
/// file it uses for everything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub port: u16,
    pub bind_address: IpAddr,
    pub public_address: IpAddr,
    pub baud: u16,
    #[serde(skip, default = "default_cycles_per_transfer")]
    pub cycles_per_transfer: CyclesPerTransfer,
    #[serde(skip)]
    pub thread_priority: Option<ThreadPriorityConfig>,
}

/// Serializable mirror of [`ThreadPriority`]; `serde` cannot derive through
/// a foreign type, so config files spell this out and [`NodeConfig`] maps
/// it onto the real enum when booting the worker threads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ThreadPriorityConfig {
    OsDefault,
    Low,
    Medium,
    High,
}

impl From<ThreadPriorityConfig> for ThreadPriority {
    fn from(value: ThreadPriorityConfig) -> Self {
        match value {
            ThreadPriorityConfig::OsDefault => ThreadPriority::OSDefault,
            ThreadPriorityConfig::Low => ThreadPriority::Low,
            ThreadPriorityConfig::Medium => ThreadPriority::Medium,
            ThreadPriorityConfig::High => ThreadPriority::High,
        }
    }
}

// `impl` by hand since `serde::Serialize`/`Deserialize` aren't derivable
// for a plain array-of-arrays newtype without pulling in a helper crate,
// and the table is never actually sent over the wire or round-tripped
// through config files in practice (it's host-supplied at construction).
impl Serialize for CyclesPerTransfer {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CyclesPerTransfer {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(CyclesPerTransfer(<[[i32; 4]; 4]>::deserialize(deserializer)?))
    }
}

fn default_cycles_per_transfer() -> CyclesPerTransfer {
    CyclesPerTransfer([[0; 4]; 4])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_indexes_by_baud_and_connected_minus_one() {
        let mut table = [[0; 4]; 4];
        table[2][1] = 512;
        let table = CyclesPerTransfer(table);
        assert_eq!(table.lookup(2, 2), Cycles(512));
    }

    #[test]
    fn lookup_clamps_out_of_range_indices() {
        let table = CyclesPerTransfer([[7; 4]; 4]);
        assert_eq!(table.lookup(99, 99), Cycles(7));
    }
}
