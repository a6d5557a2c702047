//! Loopback core stack for socket tests.
//!
//! Requests are recorded and answered by queueing the events a real stack would send.
//! Tests deliver them with [`FakeStack::pump`]. A client connecting to a PSM with a running
//! server is wired straight to it, so writes on one channel arrive as data on the other.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::os::fd::BorrowedFd;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use btif::sock::handoff;
use btif::sock::{L2capSockets, L2capStack, PollThreadPool, StackError, StackEvent, WriteStatus};
use btif::types::SecurityMask;
use btif::{BtStatus, RawAddress, SdpHandle, SlotId, SockConfig, StackHandle, Uuid};

pub const TIMEOUT: Duration = Duration::from_secs(5);
/// Address the server side sees for the connecting device.
pub const LOCAL: RawAddress = RawAddress::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
/// Address clients connect to.
pub const PEER: RawAddress = RawAddress::new([0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB]);
pub const MTU: u16 = 672;

const FIRST_DYNAMIC_PSM: u16 = 0x1001;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateSdpRecord { id: SlotId, name: String, uuid: Uuid },
    RemoveSdpRecord(SdpHandle),
    StartServer { id: SlotId, psm: u16 },
    StopServer(StackHandle),
    Connect { id: SlotId, psm: u16, addr: RawAddress },
    Discover { id: SlotId, uuid: Uuid },
    Write { handle: StackHandle, id: SlotId, data: Bytes },
    Close(StackHandle),
}

struct Channel {
    id: SlotId,
    peer: Option<StackHandle>,
}

struct State {
    calls: Vec<Call>,
    events: VecDeque<StackEvent>,
    next_handle: u32,
    next_psm: u16,
    next_record: u32,
    records: HashMap<SlotId, Uuid>,
    services: HashMap<Uuid, u16>,
    servers: HashMap<u16, StackHandle>,
    channels: HashMap<StackHandle, Channel>,
    held_discoveries: VecDeque<(SlotId, Uuid)>,
    hold_discovery: bool,
    congest_writes: bool,
}

pub struct FakeStack {
    state: Mutex<State>,
}

impl FakeStack {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                calls: Vec::new(),
                events: VecDeque::new(),
                next_handle: 1,
                next_psm: FIRST_DYNAMIC_PSM,
                next_record: 1,
                records: HashMap::new(),
                services: HashMap::new(),
                servers: HashMap::new(),
                channels: HashMap::new(),
                held_discoveries: VecDeque::new(),
                hold_discovery: false,
                congest_writes: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Deliver queued events until none are left (handling may queue more).
    pub fn pump(&self, sockets: &L2capSockets) {
        loop {
            let event = self.state().events.pop_front();
            match event {
                Some(event) => sockets.on_stack_event(event),
                None => break,
            }
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn write_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Write { .. }))
            .count()
    }

    /// Keep discoveries outstanding until [`FakeStack::finish_discovery`].
    pub fn hold_discovery(&self) {
        self.state().hold_discovery = true;
    }

    /// Answer the oldest held discovery.
    pub fn finish_discovery(&self) {
        let mut state = self.state();
        if let Some((id, uuid)) = state.held_discoveries.pop_front() {
            let event = discovery_result(&state, id, uuid);
            state.events.push_back(event);
        }
    }

    pub fn set_congested(&self, congested: bool) {
        self.state().congest_writes = congested;
    }
}

fn discovery_result(state: &State, id: SlotId, uuid: Uuid) -> StackEvent {
    match state.services.get(&uuid) {
        Some(&psm) => StackEvent::DiscoveryComplete {
            id,
            status: BtStatus::Success,
            psm,
        },
        None => StackEvent::DiscoveryComplete {
            id,
            status: BtStatus::Fail,
            psm: 0,
        },
    }
}

impl State {
    fn new_handle(&mut self) -> StackHandle {
        let handle = StackHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }
}

impl L2capStack for FakeStack {
    fn create_sdp_record(&self, id: SlotId, name: &str, uuid: Uuid) -> Result<(), StackError> {
        let mut state = self.state();
        state.calls.push(Call::CreateSdpRecord {
            id,
            name: name.to_string(),
            uuid,
        });
        let record = SdpHandle(state.next_record);
        state.next_record += 1;
        state.records.insert(id, uuid);
        state.events.push_back(StackEvent::SdpRecordCreated { id, record });
        Ok(())
    }

    fn remove_sdp_record(&self, record: SdpHandle) {
        self.state().calls.push(Call::RemoveSdpRecord(record));
    }

    fn start_server(&self, id: SlotId, psm: u16, _security: SecurityMask) -> Result<(), StackError> {
        let mut state = self.state();
        state.calls.push(Call::StartServer { id, psm });

        let psm = if psm == 0 {
            let assigned = state.next_psm;
            state.next_psm += 2;
            assigned
        } else {
            psm
        };
        let handle = state.new_handle();
        state.channels.insert(handle, Channel { id, peer: None });
        state.servers.insert(psm, handle);
        if let Some(&uuid) = state.records.get(&id) {
            state.services.insert(uuid, psm);
        }

        state.events.push_back(StackEvent::ServerStarted {
            id,
            status: BtStatus::Success,
            handle,
            psm,
        });
        Ok(())
    }

    fn stop_server(&self, handle: StackHandle) {
        let mut state = self.state();
        state.calls.push(Call::StopServer(handle));
        state.servers.retain(|_, h| *h != handle);
        state.channels.remove(&handle);
    }

    fn connect(
        &self,
        id: SlotId,
        psm: u16,
        _security: SecurityMask,
        addr: RawAddress,
    ) -> Result<(), StackError> {
        let mut state = self.state();
        state.calls.push(Call::Connect { id, psm, addr });

        let handle = state.new_handle();
        state.events.push_back(StackEvent::ClientInit {
            id,
            status: BtStatus::Success,
            handle,
        });

        let Some(listen_handle) = state.servers.remove(&psm) else {
            state.events.push_back(StackEvent::Open {
                id,
                status: BtStatus::Fail,
                handle,
                addr,
                tx_mtu: MTU,
            });
            return Ok(());
        };

        let server_id = match state.channels.get_mut(&listen_handle) {
            Some(channel) => {
                channel.peer = Some(handle);
                channel.id
            }
            None => return Err(StackError::UnknownHandle(listen_handle)),
        };
        state.channels.insert(
            handle,
            Channel {
                id,
                peer: Some(listen_handle),
            },
        );

        state.events.push_back(StackEvent::IncomingOpen {
            id: server_id,
            handle: listen_handle,
            addr: LOCAL,
            tx_mtu: MTU,
        });
        state.events.push_back(StackEvent::Open {
            id,
            status: BtStatus::Success,
            handle,
            addr,
            tx_mtu: MTU,
        });
        Ok(())
    }

    fn discover(&self, id: SlotId, _addr: RawAddress, uuid: Uuid) -> Result<(), StackError> {
        let mut state = self.state();
        state.calls.push(Call::Discover { id, uuid });
        if state.hold_discovery {
            state.held_discoveries.push_back((id, uuid));
        } else {
            let event = discovery_result(&state, id, uuid);
            state.events.push_back(event);
        }
        Ok(())
    }

    fn write(&self, handle: StackHandle, id: SlotId, data: Bytes) -> Result<WriteStatus, StackError> {
        let mut state = self.state();
        state.calls.push(Call::Write {
            handle,
            id,
            data: data.clone(),
        });

        let peer = state
            .channels
            .get(&handle)
            .ok_or(StackError::UnknownHandle(handle))?
            .peer;
        let peer_id = peer.and_then(|p| state.channels.get(&p)).map(|c| c.id);
        if let Some(peer_id) = peer_id {
            state.events.push_back(StackEvent::Data { id: peer_id, data });
        }

        if state.congest_writes {
            Ok(WriteStatus::Congested)
        } else {
            Ok(WriteStatus::Sent)
        }
    }

    fn close(&self, handle: StackHandle) {
        let mut state = self.state();
        state.calls.push(Call::Close(handle));
        let peer = state.channels.remove(&handle).and_then(|c| c.peer);
        let peer_id = peer.and_then(|p| state.channels.get(&p)).map(|c| c.id);
        if let Some(peer_id) = peer_id {
            state.events.push_back(StackEvent::Closed { id: peer_id });
        }
    }
}

pub fn setup(max_sockets: usize) -> (Arc<FakeStack>, Arc<L2capSockets>) {
    btif::logging::init_tracing();
    let config = SockConfig::new().with_max_l2cap_sockets(max_sockets);
    let pool = Arc::new(PollThreadPool::new(&config));
    let fake = Arc::new(FakeStack::new());
    let sockets = L2capSockets::new(&config, fake.clone(), pool).unwrap();
    (fake, sockets)
}

/// Spin until `done` holds, pumping stack events in between.
pub fn wait_until(fake: &FakeStack, sockets: &L2capSockets, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        fake.pump(sockets);
        if done() {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Read exactly `len` bytes from an app socket, pumping stack events while waiting.
pub fn read_exact(
    fake: &FakeStack,
    sockets: &L2capSockets,
    fd: BorrowedFd<'_>,
    len: usize,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut buf = vec![0u8; 64 * 1024];
    wait_until(fake, sockets, || {
        while out.len() < len {
            match handoff::recv_nonblocking(fd, &mut buf) {
                Ok(0) => panic!("socket closed after {} of {len} bytes", out.len()),
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return false,
                Err(e) => panic!("recv failed: {e}"),
            }
        }
        true
    });
    assert_eq!(out.len(), len, "read past the expected length");
    out
}
