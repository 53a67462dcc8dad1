mod config;
mod cycles;
mod error;
mod membership;
mod node;
mod registers;
mod transfer;

pub use config::{CyclesPerTransfer, NodeConfig, ThreadPriorityConfig};
pub use cycles::Cycles;
pub use error::MeshError;
pub use node::{Node, SIOCNT_ADDRESS, SioHostCallbacks};
pub use registers::{SioCnt, SioMulti};
pub use transfer::{TransferRound, TransferState};

pub use core_affinity;
pub use gba_sio_mesh_net as net;
pub use gba_sio_mesh_utils as utils;
pub use tracing;
