use std::net::{IpAddr, TcpListener};

use gba_sio_mesh_net::{Packet, Socket, accept, connect};
use tracing::{debug, warn};

use crate::{cycles::Cycles, error::MeshError};

/// `mesh[0..3]` minus the self-listener slot: live connections to other
/// peers, indexed by their node id. The listener is kept separately since
/// only the network thread ever touches either of these; nothing here is
/// behind the shared mutex (see DESIGN.md).
pub struct PeerTable {
    pub listener: TcpListener,
    pub peers: [Option<Socket>; 4],
}

impl PeerTable {
    pub fn bind(port: u16, bind_address: IpAddr) -> Result<PeerTable, MeshError> {
        let listener = gba_sio_mesh_net::listen(port, bind_address)?;
        Ok(PeerTable { listener, peers: [None, None, None, None] })
    }

    pub fn listening_port(&self) -> u16 {
        self.listener.local_addr().expect("bound listener has a local address").port()
    }

    pub fn set(&mut self, id: u8, socket: Socket) {
        self.peers[id as usize] = Some(socket);
    }

    pub fn close(&mut self, id: u8) {
        self.peers[id as usize] = None;
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut Socket> {
        self.peers[id as usize].as_mut()
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.peers.iter().enumerate().filter_map(|(i, s)| s.is_some().then_some(i as u8))
    }
}

/// Result of a successful join handshake (§4.3 Hello + Join).
pub struct JoinedAs {
    pub id: u8,
    pub initial_link_cycles: Cycles,
    pub connected: u8,
}

/// Connects to `master_addr:master_port`, performs the Hello/Join
/// handshake, and records the master's socket at `peers[0]`.
///
/// On any structural error the master socket is dropped and an error is
/// returned; the caller's node stays in a re-usable, unattached state.
pub fn join_mesh(
    table: &mut PeerTable,
    master_port: u16,
    master_addr: IpAddr,
    public_port: u16,
    public_addr: IpAddr,
) -> Result<JoinedAs, MeshError> {
    let mut master_socket = connect(master_port, master_addr)?;

    let hello = gba_sio_mesh_net::recv_packet(&mut master_socket)?
        .ok_or(MeshError::Protocol("connection closed before Hello"))?;
    let Packet::Hello { id, sync } = hello else {
        return Err(MeshError::Protocol("expected Hello as first packet from master"));
    };
    if !(1..=3).contains(&id) {
        return Err(MeshError::IdOutOfRange(id));
    }

    let join = Packet::Join { id, port: public_port, address: ipv4_of(public_addr)? };
    if !gba_sio_mesh_net::send_packet(&mut master_socket, join) {
        return Err(MeshError::Protocol("failed to send Join to master"));
    }

    table.set(0, master_socket);
    debug!(id, sync, "joined mesh, awaiting peer greetings");

    Ok(JoinedAs { id, initial_link_cycles: Cycles::from(sync), connected: id + 1 })
}

fn ipv4_of(addr: IpAddr) -> Result<std::net::Ipv4Addr, MeshError> {
    match addr {
        IpAddr::V4(v4) => Ok(v4),
        IpAddr::V6(_) => Err(MeshError::Protocol("IPv6 public address is not supported")),
    }
}

/// Master accept path (§4.3): a new connection arrived on the listener.
/// Assigns the next free id, greets it with a Hello, and stores the
/// socket. Returns the new id and the socket's public half is learned
/// later, when the joiner sends its Join back over this same connection.
pub fn accept_new_joiner(table: &mut PeerTable, connected: u8, link_cycles: Cycles) -> Result<u8, MeshError> {
    let mut socket = accept(&table.listener)?;
    if connected >= 4 {
        warn!(connected, "mesh is already full, rejecting new connection");
        return Err(MeshError::Protocol("mesh already has the maximum of four nodes"));
    }
    let new_id = connected;
    let hello = Packet::Hello { id: new_id, sync: link_cycles.as_u32() };
    if !gba_sio_mesh_net::send_packet(&mut socket, hello) {
        return Err(MeshError::Protocol("failed to greet new joiner"));
    }
    table.set(new_id, socket);
    Ok(new_id)
}

/// Master broadcasts a newly joined peer's Join (and address) to every
/// other already-connected peer, so each of them can greet the new peer
/// directly (§4.3 Join gossip).
pub fn broadcast_join(table: &mut PeerTable, joiner_id: u8, joiner: Packet) {
    for id in table.iter_ids().collect::<Vec<_>>() {
        if id == joiner_id {
            continue;
        }
        if let Some(socket) = table.get_mut(id) {
            if !gba_sio_mesh_net::send_packet(socket, joiner) {
                warn!(id, "failed to gossip Join to peer, dropping");
                table.close(id);
            }
        }
    }
}

/// A non-master peer received a gossiped Join from the master: open an
/// outbound connection to the new peer and greet it with our own Hello.
pub fn greet_new_peer(
    table: &mut PeerTable,
    self_id: u8,
    new_peer_id: u8,
    new_peer_port: u16,
    new_peer_addr: IpAddr,
    link_cycles: Cycles,
) -> Result<(), MeshError> {
    let mut socket = gba_sio_mesh_net::connect(new_peer_port, new_peer_addr)?;
    let hello = Packet::Hello { id: self_id, sync: link_cycles.as_u32() };
    if !gba_sio_mesh_net::send_packet(&mut socket, hello) {
        return Err(MeshError::Protocol("failed to greet new peer"));
    }
    table.set(new_peer_id, socket);
    Ok(())
}

/// A new peer's own listener received an inbound greeting connection from
/// an existing peer: accept it and read the Hello that must be the first
/// packet.
pub fn accept_greeting(table: &mut PeerTable) -> Result<u8, MeshError> {
    let mut socket = accept(&table.listener)?;
    let hello = gba_sio_mesh_net::recv_packet(&mut socket)?.ok_or(MeshError::Protocol("greeting connection closed"))?;
    let Packet::Hello { id, .. } = hello else {
        return Err(MeshError::Protocol("expected Hello as first packet from peer"));
    };
    table.set(id, socket);
    Ok(id)
}
