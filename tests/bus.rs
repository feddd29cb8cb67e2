//! End-to-end router scenarios (§8): discovery, attach, event reordering,
//! register query timeout, ack retry, and restart.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use jacbus::{Bus, BusEventKind, ClientBase, Driver, Packet};

#[derive(Default)]
struct TestDriver {
    uid: [u8; 8],
    inbox: Rc<RefCell<VecDeque<Vec<u8>>>>,
    outbox: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl Driver for TestDriver {
    fn send(&mut self, bytes: &[u8]) {
        self.outbox.borrow_mut().push(bytes.to_vec());
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        self.inbox.borrow_mut().pop_front()
    }

    fn uid(&self) -> [u8; 8] {
        self.uid
    }

    fn hash(&self, _bytes: &[u8], _bits: u32) -> u32 {
        0
    }
}

fn announce_bytes(id: [u8; 8], restart: u8, classes: &[u32]) -> Vec<u8> {
    let mut payload = vec![0u8; 4];
    payload[0] = restart;
    for c in classes {
        payload.extend_from_slice(&c.to_le_bytes());
    }
    let mut pkt = Packet::report(0, payload).unwrap();
    pkt.set_device_identifier(jacbus::DeviceId(id));
    pkt.set_service_index(0);
    pkt.to_bytes()
}

#[test]
fn discovery_fires_device_connect() {
    let inbox = Rc::new(RefCell::new(VecDeque::new()));
    let driver = TestDriver {
        uid: [0; 8],
        inbox: inbox.clone(),
        outbox: Default::default(),
    };
    let mut bus = Bus::new(driver);
    let connected = Rc::new(RefCell::new(0u32));
    let connected2 = connected.clone();
    bus.on(BusEventKind::DeviceConnect, move |_| *connected2.borrow_mut() += 1);

    let id = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
    inbox.borrow_mut().push_back(announce_bytes(id, 1, &[1, 0x1f14_0409]));
    bus.poll(0);

    assert_eq!(*connected.borrow(), 1);
    let dev = bus.devices().next().unwrap();
    assert_eq!(dev.num_service_classes(), 2);
    assert_eq!(dev.reset_count(), 1);
}

#[test]
fn preregistered_client_attaches_on_announce() {
    let inbox = Rc::new(RefCell::new(VecDeque::new()));
    let driver = TestDriver {
        uid: [0; 8],
        inbox: inbox.clone(),
        outbox: Default::default(),
    };
    let mut bus = Bus::new(driver);
    let client_id = bus.add_client(ClientBase::new(0x1f14_0409, "acc", false));

    let id = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
    inbox.borrow_mut().push_back(announce_bytes(id, 1, &[1, 0x1f14_0409]));
    bus.poll(0);

    let client = bus.client(client_id).unwrap();
    assert_eq!(client.service_index(), Some(1));
    assert_eq!(client.device(), Some(jacbus::DeviceId(id)));
}

#[test]
fn restart_with_lower_counter_destroys_and_recreates_device() {
    let inbox = Rc::new(RefCell::new(VecDeque::new()));
    let driver = TestDriver {
        uid: [0; 8],
        inbox: inbox.clone(),
        outbox: Default::default(),
    };
    let mut bus = Bus::new(driver);
    let restarts = Rc::new(RefCell::new(0u32));
    let restarts2 = restarts.clone();
    bus.on(BusEventKind::Restart, move |_| *restarts2.borrow_mut() += 1);

    let id = [9; 8];
    inbox.borrow_mut().push_back(announce_bytes(id, 5, &[1]));
    bus.poll(0);
    inbox.borrow_mut().push_back(announce_bytes(id, 1, &[1]));
    bus.poll(100);

    assert_eq!(*restarts.borrow(), 1);
    assert_eq!(bus.devices().count(), 1);
    assert_eq!(bus.devices().next().unwrap().reset_count(), 1);
}

#[test]
fn unreachable_device_is_garbage_collected() {
    let inbox = Rc::new(RefCell::new(VecDeque::new()));
    let driver = TestDriver {
        uid: [0; 8],
        inbox: inbox.clone(),
        outbox: Default::default(),
    };
    let mut bus = Bus::new(driver);
    let id = [7; 8];
    inbox.borrow_mut().push_back(announce_bytes(id, 0, &[1]));
    bus.poll(0);
    assert_eq!(bus.devices().count(), 1);

    bus.poll(5_000);
    assert_eq!(bus.devices().count(), 0);
}

#[test]
fn self_announce_goes_out_on_the_wire() {
    let outbox = Rc::new(RefCell::new(Vec::new()));
    let driver = TestDriver {
        uid: [3; 8],
        inbox: Default::default(),
        outbox: outbox.clone(),
    };
    let mut bus = Bus::new(driver);
    bus.poll(0);
    assert!(!outbox.borrow().is_empty());
    let frame = &outbox.borrow()[0];
    let pkt = Packet::from_bytes(frame).unwrap();
    assert_eq!(pkt.device_identifier(), jacbus::DeviceId([3; 8]));
    assert_eq!(pkt.service_index(), 0);
}

#[test]
fn identify_command_emits_identify_event() {
    let inbox = Rc::new(RefCell::new(VecDeque::new()));
    let driver = TestDriver {
        uid: [5; 8],
        inbox: inbox.clone(),
        outbox: Default::default(),
    };
    let mut bus = Bus::new(driver);
    let fired = Rc::new(RefCell::new(false));
    let fired2 = fired.clone();
    bus.on(BusEventKind::Identify, move |_| *fired2.borrow_mut() = true);

    let mut pkt = Packet::command(0x81, vec![]).unwrap();
    pkt.set_device_identifier(jacbus::DeviceId([5; 8]));
    pkt.set_service_index(0);
    inbox.borrow_mut().push_back(pkt.to_bytes());
    bus.poll(0);

    assert!(*fired.borrow());
}
