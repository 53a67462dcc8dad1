use std::{
    net::IpAddr,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::JoinHandle,
};

use gba_sio_mesh_net::{Packet, Socket, Waitable};
use gba_sio_mesh_utils::thread_boot;
use tracing::{debug, error, warn};

use crate::{
    config::NodeConfig,
    cycles::Cycles,
    error::MeshError,
    membership::{self, PeerTable},
    registers::{self, SioCnt},
    transfer::{TransferRound, TransferState},
};

/// SIOCNT's memory-mapped address in the guest's I/O region. The mesh only
/// ever intercepts writes at this address; everything else passes through.
pub const SIOCNT_ADDRESS: u32 = 0x0400_0128;

/// Host-provided operations the mesh needs on the emulator-thread side:
/// reading the outgoing transfer word, writing the incoming ones back into
/// guest memory, and raising the SIO interrupt. Implemented by the host
/// emulator core; this crate never assumes a concrete core type.
pub trait SioHostCallbacks: Send {
    fn read_siomlt_send(&mut self) -> u16;
    fn write_siomulti(&mut self, values: [u16; 4]);
    fn raise_sio_irq(&mut self);
    /// `multiplayerControl.irq`: whether the guest has SIO interrupts
    /// enabled. Consulted before every `raise_sio_irq` call; this crate
    /// never assumes interrupts are wanted.
    fn multiplayer_irq_enabled(&self) -> bool;
}

/// Cross-thread state the network thread and the caller's emulator thread
/// both touch: the transfer state machine, cycle accumulators, and the
/// membership count. Peer sockets themselves are owned solely by the
/// network thread and are *not* behind this lock (see DESIGN.md).
struct SharedState {
    id: u8,
    connected: u8,
    siocnt: SioCnt,
    transfer_state: TransferState,
    round: TransferRound,
    transfer_time: Cycles,
    link_cycles: Cycles,
    next_event: Cycles,
    active: bool,
}

struct NodeShared {
    state: Mutex<SharedState>,
    /// Network thread waits here for the emulator thread to produce
    /// per-round setup (master PENDING, slave GOT_START->SENT_DATA).
    data_gba_cond: Condvar,
    /// Emulator thread waits here for the network thread to deliver a
    /// TransferStart or finish a round.
    data_network_cond: Condvar,
    wake_writer: Mutex<Socket>,
}

fn lock_state(shared: &NodeShared) -> MutexGuard<'_, SharedState> {
    shared.state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn new_shared(id: u8, connected: u8, link_cycles: Cycles, wake_writer: Socket) -> NodeShared {
    let mut siocnt = SioCnt::default();
    siocnt.set_id(id as u16);
    siocnt.set_slave(id != 0);
    siocnt.set_ready(connected >= 2);

    NodeShared {
        state: Mutex::new(SharedState {
            id,
            connected,
            siocnt,
            transfer_state: TransferState::Idle,
            round: TransferRound::setup(connected, id, 0xFFFF),
            transfer_time: Cycles::ZERO,
            link_cycles,
            next_event: Cycles::FAR_FUTURE,
            active: true,
        }),
        data_gba_cond: Condvar::new(),
        data_network_cond: Condvar::new(),
        wake_writer: Mutex::new(wake_writer),
    }
}

/// A running mesh node: the caller's thread drives [`Node::write_register`]
/// and [`Node::process_events`] (the "emulator thread" of the design), and
/// an internally spawned thread drives the membership/transfer network
/// protocol.
pub struct Node {
    shared: Arc<NodeShared>,
    host: Box<dyn SioHostCallbacks>,
    config: NodeConfig,
    listening_port: u16,
    network_thread: Option<JoinHandle<()>>,
}

impl Node {
    /// Creates the master of a new mesh: binds the listener, `id == 0`.
    /// Starts the network thread immediately (attach and create are one
    /// step in this implementation; see DESIGN.md).
    pub fn create_master(config: NodeConfig, host: Box<dyn SioHostCallbacks>) -> Result<Node, MeshError> {
        let table = PeerTable::bind(config.port, config.bind_address)?;
        Self::spawn(config, host, table, 0, 1, Cycles::ZERO)
    }

    /// Joins an existing mesh: binds our own listener for later peer
    /// greetings, connects to the master, and performs the Hello/Join
    /// handshake synchronously before the network thread starts.
    pub fn connect_slave(config: NodeConfig, host: Box<dyn SioHostCallbacks>, master_port: u16, master_addr: IpAddr) -> Result<Node, MeshError> {
        let mut table = PeerTable::bind(config.port, config.bind_address)?;
        let public_port = table.listening_port();
        let joined = membership::join_mesh(&mut table, master_port, master_addr, public_port, config.public_address)?;
        Self::spawn(config, host, table, joined.id, joined.connected, joined.initial_link_cycles)
    }

    fn spawn(
        config: NodeConfig,
        host: Box<dyn SioHostCallbacks>,
        table: PeerTable,
        id: u8,
        connected: u8,
        link_cycles: Cycles,
    ) -> Result<Node, MeshError> {
        let listening_port = table.listening_port();
        let (wake_writer, wake_reader) = gba_sio_mesh_net::wake_pair()?;
        let shared = Arc::new(new_shared(id, connected, link_cycles, wake_writer));

        let thread_shared = Arc::clone(&shared);
        let priority = config.thread_priority.map(Into::into).unwrap_or(gba_sio_mesh_utils::ThreadPriority::OSDefault);
        let network_thread = std::thread::Builder::new()
            .name(format!("gba-sio-net-{id}"))
            .spawn(move || {
                thread_boot(None, priority);
                network_thread_main(thread_shared, table, wake_reader);
            })
            .expect("spawning the mesh network thread");

        Ok(Node { shared, host, config, listening_port, network_thread: Some(network_thread) })
    }

    /// The port this node's peer listener bound to, useful when `config.port`
    /// was `0` and the OS picked an ephemeral one.
    pub fn listening_port(&self) -> u16 {
        self.listening_port
    }

    /// This node's id: `0` for the master, `1..=3` for a joined slave.
    pub fn id(&self) -> u8 {
        lock_state(&self.shared).id
    }

    /// Intercepts writes to SIOCNT; all other addresses pass through
    /// unchanged (§4.5).
    pub fn write_register(&mut self, address: u32, value: u16) -> u16 {
        if address != SIOCNT_ADDRESS {
            return value;
        }

        let mut state = lock_state(&self.shared);
        let merged = (value & !registers::READ_ONLY_MASK) | (state.siocnt.packed() & registers::READ_ONLY_MASK);
        state.siocnt.set_packed(merged);

        if value & registers::START_BIT != 0 {
            if state.id != 0 {
                warn!(id = state.id, "slave rejected SIOCNT.START write");
                state.siocnt.set_busy(false);
            } else {
                match state.transfer_state.to_pending() {
                    Some(next) => {
                        let word = self.host.read_siomlt_send();
                        state.round = TransferRound::setup(state.connected, 0, word);
                        state.transfer_time = self.config.cycles_per_transfer.lookup(state.siocnt.baud(), state.connected);
                        state.next_event = state.transfer_time;
                        state.transfer_state = next;
                        state.siocnt.set_busy(true);
                        drop(state);
                        self.shared.data_gba_cond.notify_all();
                        gba_sio_mesh_net::wake(&mut lock_wake(&self.shared));
                        return lock_state(&self.shared).siocnt.packed();
                    }
                    None => warn!("transfer backed up, new SIOCNT.START ignored until current round finishes"),
                }
            }
        }
        state.siocnt.packed()
    }

    /// Copies the stored SIOCNT into the guest-visible register on mode
    /// entry, preserving the guest's own baud-rate bits.
    pub fn load(&self, current_hardware_value: u16) -> u16 {
        let state = lock_state(&self.shared);
        (state.siocnt.packed() & !0x0003) | (current_hardware_value & 0x0003)
    }

    /// Drives `linkCycles`/`nextEvent` and the emulator-thread side of the
    /// transfer rendezvous. May block on `dataNetworkCond` while a round is
    /// in flight on another node (§5 suspension points).
    pub fn process_events(&mut self, cycles_elapsed: i32) -> i32 {
        let mut state = lock_state(&self.shared);
        state.link_cycles += Cycles(cycles_elapsed);
        state.next_event -= Cycles(cycles_elapsed);

        if state.next_event.0 > 0 {
            return state.next_event.0;
        }

        loop {
            match state.transfer_state {
                TransferState::Idle => {
                    state.next_event = Cycles::FAR_FUTURE;
                    break;
                }
                TransferState::Pending | TransferState::SentData => {
                    state = self
                        .shared
                        .data_network_cond
                        .wait_while(state, |s| matches!(s.transfer_state, TransferState::Pending | TransferState::SentData))
                        .unwrap_or_else(PoisonError::into_inner);
                }
                TransferState::GotStart => {
                    let word = self.host.read_siomlt_send();
                    state.round = TransferRound::setup(state.connected, state.id, word);
                    let next = state.transfer_state.got_start_to_sent_data();
                    gba_sio_mesh_utils::safe_assert!(next.is_some(), "got_start_to_sent_data called from {:?}", state.transfer_state);
                    state.transfer_state = next.unwrap_or(state.transfer_state);
                    self.shared.data_gba_cond.notify_all();
                }
                TransferState::Finished => {
                    self.host.write_siomulti(state.round.values.0);
                    if self.host.multiplayer_irq_enabled() {
                        self.host.raise_sio_irq();
                    }
                    let next = state.transfer_state.to_idle();
                    gba_sio_mesh_utils::safe_assert!(next.is_some(), "to_idle called from {:?}", state.transfer_state);
                    state.transfer_state = next.unwrap_or(state.transfer_state);
                    state.next_event = Cycles::FAR_FUTURE;
                    break;
                }
            }
        }

        state.next_event.0
    }

    /// Signals shutdown, wakes the network thread out of any blocking
    /// wait, and joins it.
    pub fn shutdown(mut self) {
        {
            let mut state = lock_state(&self.shared);
            state.active = false;
            self.shared.data_gba_cond.notify_all();
            self.shared.data_network_cond.notify_all();
        }
        gba_sio_mesh_net::wake(&mut lock_wake(&self.shared));
        if let Some(handle) = self.network_thread.take() {
            let _ = handle.join();
        }
    }
}

fn lock_wake(shared: &NodeShared) -> std::sync::MutexGuard<'_, Socket> {
    shared.wake_writer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The network thread's whole life: membership gossip plus driving the
/// network-thread side of each transfer round, until `active` is cleared.
fn network_thread_main(shared: Arc<NodeShared>, mut table: PeerTable, mut wake_reader: Socket) {
    loop {
        let (active, is_master, should_broadcast) = {
            let state = lock_state(&shared);
            (state.active, state.id == 0, matches!(state.transfer_state, TransferState::Pending))
        };
        if !active {
            break;
        }
        if is_master && should_broadcast {
            master_broadcast_round_start(&shared, &mut table);
            continue;
        }

        let peer_ids: Vec<u8> = table.iter_ids().collect();
        let mut waitables = vec![Waitable::Listener(&table.listener)];
        waitables.push(Waitable::Peer(&wake_reader));
        for id in &peer_ids {
            waitables.push(Waitable::Peer(table.peers[*id as usize].as_ref().unwrap()));
        }

        let ready = match gba_sio_mesh_net::select_readable(&waitables) {
            Ok(idx) => idx,
            Err(err) => {
                error!(%err, "select failed, stopping network thread");
                break;
            }
        };

        if ready == 0 {
            handle_new_connection(&shared, &mut table);
        } else if ready == 1 {
            gba_sio_mesh_net::drain_wake(&mut wake_reader);
        } else {
            let peer_id = peer_ids[ready - 2];
            handle_peer_readable(&shared, &mut table, peer_id);
        }
    }
}

fn master_broadcast_round_start(shared: &Arc<NodeShared>, table: &mut PeerTable) {
    let (sync, own_word, peer_ids) = {
        let state = lock_state(shared);
        (state.link_cycles.as_u32(), state.round.values.0[0], table.iter_ids().collect::<Vec<_>>())
    };

    for id in &peer_ids {
        if let Some(socket) = table.get_mut(*id) {
            if !gba_sio_mesh_net::send_packet(socket, Packet::TransferStart { sync }) {
                table.close(*id);
                continue;
            }
            gba_sio_mesh_net::send_packet(socket, Packet::TransferData { id: 0, data: own_word });
        }
    }

    let mut state = lock_state(shared);
    if let Some(next) = state.transfer_state.pending_to_sent_data() {
        state.transfer_state = next;
        state.link_cycles = Cycles::ZERO;
    }
}

fn handle_new_connection(shared: &Arc<NodeShared>, table: &mut PeerTable) {
    let (is_master, connected, link_cycles) = {
        let state = lock_state(shared);
        (state.id == 0, state.connected, state.link_cycles)
    };

    if is_master {
        match membership::accept_new_joiner(table, connected, link_cycles) {
            Ok(new_id) => {
                let mut state = lock_state(shared);
                state.connected = state.connected.max(new_id + 1);
                state.siocnt.set_ready(state.connected >= 2);
                debug!(new_id, connected = state.connected, "master greeted new joiner");
            }
            Err(err) => warn!(%err, "failed to accept new joiner"),
        }
    } else {
        match membership::accept_greeting(table) {
            Ok(new_id) => {
                let mut state = lock_state(shared);
                state.connected = state.connected.max(new_id + 1);
                debug!(new_id, connected = state.connected, "accepted peer greeting");
            }
            Err(err) => warn!(%err, "failed to accept peer greeting"),
        }
    }
}

fn handle_peer_readable(shared: &Arc<NodeShared>, table: &mut PeerTable, peer_id: u8) {
    let Some(socket) = table.get_mut(peer_id) else { return };
    let packet = match gba_sio_mesh_net::recv_packet(socket) {
        Ok(Some(p)) => p,
        Ok(None) => {
            warn!(peer_id, "short read, closing peer");
            table.close(peer_id);
            return;
        }
        Err(err) => {
            warn!(peer_id, %err, "protocol violation, dropping packet");
            return;
        }
    };

    match packet {
        Packet::Join { id: joiner_id, port, address } => {
            let self_id = lock_state(shared).id;
            if self_id == 0 {
                if peer_id != joiner_id {
                    warn!(peer_id, joiner_id, "Join id mismatch, dropping");
                    return;
                }
                membership::broadcast_join(table, joiner_id, Packet::Join { id: joiner_id, port, address });
            } else if peer_id != 0 {
                warn!(peer_id, "peers only accept Join from index 0, dropping");
            } else {
                let link_cycles = lock_state(shared).link_cycles;
                if let Err(err) = membership::greet_new_peer(table, self_id, joiner_id, port, IpAddr::V4(address), link_cycles) {
                    warn!(%err, joiner_id, "failed to greet gossiped peer");
                    return;
                }
                let mut state = lock_state(shared);
                state.connected = state.connected.max(joiner_id + 1);
            }
        }
        Packet::TransferStart { sync } => {
            if peer_id != 0 {
                warn!(peer_id, "invalid transfer start, dropping");
                return;
            }
            let mut state = lock_state(shared);
            let skew = state.link_cycles - Cycles::from(sync);
            debug!(skew = skew.0, "slave rebasing link cycles on TransferStart");
            state.link_cycles = state.link_cycles.rebase(sync);
            state.transfer_time += state.link_cycles;
            match state.transfer_state.to_got_start() {
                Some(next) => {
                    state.transfer_state = next;
                    state.next_event = Cycles::ZERO;
                }
                None => {
                    error!(state = ?state.transfer_state, "SIO entered bad state handling TransferStart");
                    state.next_event = Cycles(32);
                }
            }
            drop(state);

            let mut state = shared
                .data_gba_cond
                .wait_while(lock_state(shared), |s| s.transfer_state == TransferState::GotStart)
                .unwrap_or_else(PoisonError::into_inner);
            let own_word = state.round.values.0[state.id as usize];
            let own_id = state.id;
            drop(state);

            broadcast_own_data(shared, table, own_id, own_word);
        }
        Packet::TransferData { id: sender_claimed_id, data } => {
            if sender_claimed_id != peer_id {
                warn!(peer_id, sender_claimed_id, "TransferData id mismatch, dropping");
                return;
            }
            let mut state = lock_state(shared);
            if state.round.record(sender_claimed_id, data) {
                if let Some(next) = state.transfer_state.to_finished() {
                    state.transfer_state = next;
                    let time_left = state.transfer_time - state.link_cycles;
                    state.next_event = time_left;
                    let id = state.id;
                    state.siocnt.set_busy(false);
                    state.siocnt.set_id(id as u16);
                    shared.data_network_cond.notify_all();
                }
            }
        }
        Packet::Hello { .. } | Packet::Leave => {
            debug!(peer_id, ?packet, "ignoring out-of-band packet on established peer link");
        }
    }
}

fn broadcast_own_data(shared: &Arc<NodeShared>, table: &mut PeerTable, own_id: u8, own_word: u16) {
    let peer_ids: Vec<u8> = table.iter_ids().collect();
    for id in peer_ids {
        if let Some(socket) = table.get_mut(id) {
            if !gba_sio_mesh_net::send_packet(socket, Packet::TransferData { id: own_id, data: own_word }) {
                table.close(id);
            }
        }
    }
}
