mod codec;
mod socket;

pub use codec::{CodecError, Packet};
pub use socket::{
    Socket, SocketError, Waitable, accept, connect, connect_timeout, drain_wake, listen, select_readable, wake,
    wake_pair,
};

use std::net::Ipv4Addr;

/// Reads one packet off `socket`, following the variable-length Join layout.
///
/// Returns `Ok(None)` on a clean close (treated identically to any other
/// short read by the caller: close the peer).
pub fn recv_packet(socket: &mut Socket) -> Result<Option<Packet>, CodecError> {
    let mut type_byte = [0u8; 1];
    if !socket.recv_exact(&mut type_byte) {
        return Ok(None);
    }

    let fixed_len = Packet::fixed_len(type_byte[0])?;
    let mut rest = vec![0u8; fixed_len - 1];
    if !socket.recv_exact(&mut rest) {
        return Ok(None);
    }

    let mut full = Vec::with_capacity(fixed_len + 16);
    full.push(type_byte[0]);
    full.extend_from_slice(&rest);

    if type_byte[0] == codec::PACKET_JOIN {
        let (id, port, ip_version) = Packet::decode_join_header(&full);
        // `ip_version` is wire-controlled; don't trust it enough to size a
        // single allocation. Only 4 (IPv4) is ever accepted, so anything
        // else is drained in bounded chunks (to keep the stream framed, per
        // the Address encoding note) and reported without ever allocating
        // more than a few bytes.
        if ip_version != 4 {
            if !socket.recv_discard(u64::from(ip_version)) {
                return Ok(None);
            }
            return Err(CodecError::UnsupportedIpVersion(ip_version));
        }
        let mut addr_buf = vec![0u8; ip_version as usize];
        if !socket.recv_exact(&mut addr_buf) {
            return Ok(None);
        }
        return Ok(Some(Packet::decode_join(id, port, ip_version, &addr_buf)?));
    }

    Ok(Some(Packet::decode_fixed(&full)?))
}

/// Sends one packet, looping past partial writes. Returns `false` on I/O
/// error, mirroring [`Socket::send_all`].
pub fn send_packet(socket: &mut Socket, packet: Packet) -> bool {
    socket.send_all(&packet.encode())
}

pub fn join_packet(id: u8, port: u16, address: Ipv4Addr) -> Packet {
    Packet::Join { id, port, address }
}
