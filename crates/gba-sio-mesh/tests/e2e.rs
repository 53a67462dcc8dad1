use std::{
    net::{IpAddr, Ipv4Addr},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, Ordering},
    },
    time::{Duration, Instant},
};

use gba_sio_mesh::{CyclesPerTransfer, Node, NodeConfig, SIOCNT_ADDRESS, SioHostCallbacks};

struct TestHost {
    outgoing: u16,
    incoming: Arc<Mutex<[u16; 4]>>,
    irqs: Arc<AtomicU8>,
}

impl SioHostCallbacks for TestHost {
    fn read_siomlt_send(&mut self) -> u16 {
        self.outgoing
    }

    fn write_siomulti(&mut self, values: [u16; 4]) {
        *self.incoming.lock().unwrap() = values;
    }

    fn raise_sio_irq(&mut self) {
        self.irqs.fetch_add(1, Ordering::SeqCst);
    }

    fn multiplayer_irq_enabled(&self) -> bool {
        true
    }
}

fn loopback_config() -> NodeConfig {
    NodeConfig {
        port: 0,
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        public_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        baud: 0,
        cycles_per_transfer: CyclesPerTransfer([[0; 4]; 4]),
        thread_priority: None,
    }
}

/// Repeatedly drives `process_events` until an IRQ has fired or the
/// deadline passes; a round that never finishes would otherwise hang the
/// test forever since `process_events` itself can block indefinitely.
fn pump_until_irq(node: &mut Node, irqs: &AtomicU8) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while irqs.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        node.process_events(64);
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn two_node_transfer_round_delivers_both_words() {
    let master_incoming = Arc::new(Mutex::new([0u16; 4]));
    let slave_incoming = Arc::new(Mutex::new([0u16; 4]));
    let master_irqs = Arc::new(AtomicU8::new(0));
    let slave_irqs = Arc::new(AtomicU8::new(0));

    let mut master = Node::create_master(
        loopback_config(),
        Box::new(TestHost { outgoing: 0x1111, incoming: Arc::clone(&master_incoming), irqs: Arc::clone(&master_irqs) }),
    )
    .unwrap();
    let master_port = master.listening_port();

    let mut slave = Node::connect_slave(
        loopback_config(),
        Box::new(TestHost { outgoing: 0x2222, incoming: Arc::clone(&slave_incoming), irqs: Arc::clone(&slave_irqs) }),
        master_port,
        IpAddr::V4(Ipv4Addr::LOCALHOST),
    )
    .unwrap();

    // Let the master's network thread accept the join before starting a round.
    std::thread::sleep(Duration::from_millis(50));

    master.write_register(SIOCNT_ADDRESS, 0x0080);

    std::thread::scope(|scope| {
        scope.spawn(|| pump_until_irq(&mut master, &master_irqs));
        scope.spawn(|| pump_until_irq(&mut slave, &slave_irqs));
    });

    assert_eq!(master_irqs.load(Ordering::SeqCst), 1);
    assert_eq!(slave_irqs.load(Ordering::SeqCst), 1);
    assert_eq!(*master_incoming.lock().unwrap(), [0x1111, 0x2222, 0xFFFF, 0xFFFF]);
    assert_eq!(*slave_incoming.lock().unwrap(), [0x1111, 0x2222, 0xFFFF, 0xFFFF]);

    master.shutdown();
    slave.shutdown();
}

#[test]
fn three_node_join_gossip_completes_full_mesh_round() {
    let words = [0x1111u16, 0x2222, 0x3333];
    let incoming: Vec<_> = (0..3).map(|_| Arc::new(Mutex::new([0u16; 4]))).collect();
    let irqs: Vec<_> = (0..3).map(|_| Arc::new(AtomicU8::new(0))).collect();

    let mut master = Node::create_master(
        loopback_config(),
        Box::new(TestHost { outgoing: words[0], incoming: Arc::clone(&incoming[0]), irqs: Arc::clone(&irqs[0]) }),
    )
    .unwrap();
    let master_port = master.listening_port();

    let mut slave_a = Node::connect_slave(
        loopback_config(),
        Box::new(TestHost { outgoing: words[1], incoming: Arc::clone(&incoming[1]), irqs: Arc::clone(&irqs[1]) }),
        master_port,
        IpAddr::V4(Ipv4Addr::LOCALHOST),
    )
    .unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let mut slave_b = Node::connect_slave(
        loopback_config(),
        Box::new(TestHost { outgoing: words[2], incoming: Arc::clone(&incoming[2]), irqs: Arc::clone(&irqs[2]) }),
        master_port,
        IpAddr::V4(Ipv4Addr::LOCALHOST),
    )
    .unwrap();

    // Let the gossiped Join reach slave_a and the greeting connections settle
    // before relying on `connected == 3` at every node.
    std::thread::sleep(Duration::from_millis(100));

    assert_eq!(master.id(), 0);
    assert_eq!(slave_a.id(), 1);
    assert_eq!(slave_b.id(), 2);

    master.write_register(SIOCNT_ADDRESS, 0x0080);

    std::thread::scope(|scope| {
        scope.spawn(|| pump_until_irq(&mut master, &irqs[0]));
        scope.spawn(|| pump_until_irq(&mut slave_a, &irqs[1]));
        scope.spawn(|| pump_until_irq(&mut slave_b, &irqs[2]));
    });

    for (i, irq) in irqs.iter().enumerate() {
        assert_eq!(irq.load(Ordering::SeqCst), 1, "node {i} never finished its round");
    }
    let expected = [words[0], words[1], words[2], 0xFFFF];
    for (i, slot) in incoming.iter().enumerate() {
        assert_eq!(*slot.lock().unwrap(), expected, "node {i} saw the wrong round data");
    }

    master.shutdown();
    slave_a.shutdown();
    slave_b.shutdown();
}

#[test]
fn slave_write_register_start_is_rejected() {
    let master_incoming = Arc::new(Mutex::new([0u16; 4]));
    let master_irqs = Arc::new(AtomicU8::new(0));
    let mut master = Node::create_master(
        loopback_config(),
        Box::new(TestHost { outgoing: 0x1111, incoming: Arc::clone(&master_incoming), irqs: Arc::clone(&master_irqs) }),
    )
    .unwrap();
    let master_port = master.listening_port();

    let slave_incoming = Arc::new(Mutex::new([0u16; 4]));
    let slave_irqs = Arc::new(AtomicU8::new(0));
    let mut slave = Node::connect_slave(
        loopback_config(),
        Box::new(TestHost { outgoing: 0x2222, incoming: Arc::clone(&slave_incoming), irqs: Arc::clone(&slave_irqs) }),
        master_port,
        IpAddr::V4(Ipv4Addr::LOCALHOST),
    )
    .unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let result = slave.write_register(SIOCNT_ADDRESS, 0x0080);
    assert_eq!(result & 0x0080, 0, "a slave's START write must not latch busy");

    // No round was ever started, so neither side should ever see an IRQ.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(master_irqs.load(Ordering::SeqCst), 0);
    assert_eq!(slave_irqs.load(Ordering::SeqCst), 0);

    master.shutdown();
    slave.shutdown();
}
