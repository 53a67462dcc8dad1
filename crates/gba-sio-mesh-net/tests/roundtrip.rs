use std::{net::Ipv4Addr, thread};

use gba_sio_mesh_net::{Packet, accept, connect, listen, recv_packet, send_packet};

#[test]
fn hello_travels_over_a_real_socket() {
    let listener = listen(0, Ipv4Addr::LOCALHOST.into()).unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let mut socket = accept(&listener).unwrap();
        recv_packet(&mut socket).unwrap().unwrap()
    });

    let mut client = connect(port, Ipv4Addr::LOCALHOST.into()).unwrap();
    assert!(send_packet(&mut client, Packet::Hello { id: 2, sync: 42 }));

    let received = server.join().unwrap();
    assert_eq!(received, Packet::Hello { id: 2, sync: 42 });
}

#[test]
fn join_with_address_travels_over_a_real_socket() {
    let listener = listen(0, Ipv4Addr::LOCALHOST.into()).unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let mut socket = accept(&listener).unwrap();
        recv_packet(&mut socket).unwrap().unwrap()
    });

    let mut client = connect(port, Ipv4Addr::LOCALHOST.into()).unwrap();
    let join = gba_sio_mesh_net::join_packet(2, 0x1234, Ipv4Addr::new(10, 0, 0, 5));
    assert!(send_packet(&mut client, join));

    let received = server.join().unwrap();
    assert_eq!(received, join);
}

#[test]
fn short_read_is_reported_as_connection_closed() {
    let listener = listen(0, Ipv4Addr::LOCALHOST.into()).unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let mut socket = accept(&listener).unwrap();
        recv_packet(&mut socket).unwrap()
    });

    let client = connect(port, Ipv4Addr::LOCALHOST.into()).unwrap();
    drop(client);

    assert_eq!(server.join().unwrap(), None);
}
