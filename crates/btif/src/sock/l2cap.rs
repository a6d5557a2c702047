//! L2CAP socket slot table.
//!
//! Each slot bridges one stack channel to one end of a local seqpacket socket pair. The
//! other end is handed to the application, which reads and writes it like any socket.
//!
//! - app writes: our end turns readable, the poll thread reads one packet and passes it to
//!   the stack. Reading pauses while the stack reports congestion.
//! - stack data: sent to our end without blocking. If that would block, or data is already
//!   queued, the packet is queued in order and write readiness is armed to drain it.
//! - accept: a fresh slot takes over the connection and the listener re-listens. The two
//!   slots swap stack ids: the connection keeps the id the stack already tags its events
//!   with, the listener re-listens under the fresh one. Slot ids never move, so the id
//!   `listen()` returned keeps naming the listener. The connection's app end travels to the
//!   listener's app end as SCM_RIGHTS with a [`ConnectSignal`].
//!
//! Every slot has two ids. `id` is fixed per slot and is what callers and the poll thread
//! see. `stack_id` correlates requests and [`StackEvent`]s with the core stack and is the one
//! exchanged on accept.
//!
//! One mutex covers the whole table. Stack requests are issued with it held.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use bytes::{Buf, Bytes, BytesMut};
use serde::Serialize;

use crate::config::SockConfig;
use crate::ids::{PollHandle, SdpHandle, SlotId, SockTable, StackHandle};
use crate::sock::error::SockError;
use crate::sock::handoff::{self, ConnectSignal};
use crate::sock::stack::{L2capStack, StackError, StackEvent, WriteStatus};
use crate::sock::thread::{PollEvent, PollFlags, PollThreadPool};
use crate::types::{BtStatus, RawAddress, SOCK_FLAG_NO_SDP, SecurityMask, SocketType, Uuid};

/// Minimum L2CAP MTU; also the receive size advertised in connect signals.
const DEFAULT_MTU: u16 = 672;

struct L2capSlot {
    id: SlotId,
    stack_id: SlotId,
    in_use: bool,
    server: bool,
    connected: bool,
    congested: bool,
    sdp_pending: bool,
    doing_sdp: bool,
    psm_sent: bool,
    security: SecurityMask,
    psm: u16,
    addr: RawAddress,
    name: String,
    uuid: Option<Uuid>,
    our_fd: Option<OwnedFd>,
    /// Interest registered with the poll thread and not yet reported back.
    armed: PollFlags,
    handle: Option<StackHandle>,
    sdp_record: Option<SdpHandle>,
    tx_mtu: u16,
    /// Stack data not yet accepted by our socket end.
    to_app: VecDeque<Bytes>,
}

impl L2capSlot {
    fn vacant(id: SlotId, stack_id: SlotId) -> Self {
        Self {
            id,
            stack_id,
            in_use: false,
            server: false,
            connected: false,
            congested: false,
            sdp_pending: false,
            doing_sdp: false,
            psm_sent: false,
            security: SecurityMask::NONE,
            psm: 0,
            addr: RawAddress::empty(),
            name: String::new(),
            uuid: None,
            our_fd: None,
            armed: PollFlags::NONE,
            handle: None,
            sdp_record: None,
            tx_mtu: DEFAULT_MTU,
            to_app: VecDeque::new(),
        }
    }

    fn our_raw_fd(&self) -> Option<RawFd> {
        self.our_fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            id: self.id,
            stack_id: self.stack_id,
            name: self.name.clone(),
            uuid: self.uuid.map(|u| u.to_string()),
            psm: self.psm,
            addr: self.addr.to_string(),
            server: self.server,
            connected: self.connected,
            congested: self.congested,
            sdp_pending: self.sdp_pending,
            doing_sdp: self.doing_sdp,
            handle: self.handle,
            sdp_record: self.sdp_record,
            queued_bytes: self.to_app.iter().map(Bytes::len).sum(),
        }
    }
}

/// Serializable view of one in-use slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotSnapshot {
    pub id: SlotId,
    pub stack_id: SlotId,
    pub name: String,
    pub uuid: Option<String>,
    pub psm: u16,
    pub addr: String,
    pub server: bool,
    pub connected: bool,
    pub congested: bool,
    pub sdp_pending: bool,
    pub doing_sdp: bool,
    pub handle: Option<StackHandle>,
    pub sdp_record: Option<SdpHandle>,
    pub queued_bytes: usize,
}

struct SlotTable {
    slots: Vec<L2capSlot>,
    free: VecDeque<usize>,
    /// A service discovery is outstanding. Only one runs at a time.
    sdp_busy: bool,
    stopped: bool,
}

impl SlotTable {
    fn find(&self, id: SlotId) -> Option<usize> {
        self.slots.iter().position(|s| s.in_use && s.id == id)
    }

    fn find_stack(&self, stack_id: SlotId) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.in_use && s.stack_id == stack_id)
    }
}

/// Fixed-size table of L2CAP socket slots served by one poll thread.
pub struct L2capSockets {
    table: Mutex<SlotTable>,
    stack: Arc<dyn L2capStack>,
    pool: Arc<PollThreadPool>,
    poll: PollHandle,
}

struct NewSlot<'a> {
    name: &'a str,
    uuid: Option<Uuid>,
    psm: u16,
    addr: RawAddress,
    server: bool,
    security: SecurityMask,
}

fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Send queued buffers to `fd` in order. A short send trims the head buffer in place.
/// Returns whether data is still queued.
///
/// Our end is a seqpacket socket, where a send is all or nothing; short sends only happen
/// on stream sockets.
fn drain_queue(fd: BorrowedFd<'_>, queue: &mut VecDeque<Bytes>) -> io::Result<bool> {
    while let Some(front) = queue.front_mut() {
        match handoff::send_nonblocking(fd, front) {
            Ok(n) if n >= front.len() => {
                queue.pop_front();
            }
            Ok(n) => {
                front.advance(n);
                return Ok(true);
            }
            Err(e) if would_block(&e) => return Ok(true),
            Err(e) => return Err(e),
        }
    }
    Ok(false)
}

impl L2capSockets {
    /// Build the table and start its poll thread on `pool`.
    pub fn new(
        config: &SockConfig,
        stack: Arc<dyn L2capStack>,
        pool: Arc<PollThreadPool>,
    ) -> Result<Arc<Self>, SockError> {
        let count = config.max_l2cap_sockets.min(SockTable::SPAN as usize);
        let slots: Vec<L2capSlot> = (0..count)
            .filter_map(|index| SlotId::new(SockTable::L2cap, index))
            .map(|id| L2capSlot::vacant(id, id))
            .collect();

        let owner: Arc<OnceLock<Weak<L2capSockets>>> = Arc::new(OnceLock::new());
        let signaled_owner = Arc::clone(&owner);
        let poll = pool.create(
            move |event| {
                if let Some(sockets) = signaled_owner.get().and_then(Weak::upgrade) {
                    sockets.on_signaled(event);
                }
            },
            |cmd| {
                tracing::debug!(cmd_type = cmd.cmd_type, user_id = cmd.user_id, "Ignoring poll command");
            },
        )?;

        let sockets = Arc::new(Self {
            table: Mutex::new(SlotTable {
                free: (0..slots.len()).collect(),
                slots,
                sdp_busy: false,
                stopped: false,
            }),
            stack,
            pool,
            poll,
        });
        let _ = owner.set(Arc::downgrade(&sockets));

        tracing::debug!(%poll, slots = count, "L2CAP socket table ready");
        Ok(sockets)
    }

    /// Start a listening socket.
    ///
    /// With a service UUID (and without `SOCK_FLAG_NO_SDP`) an SDP record is created first.
    /// `psm == 0` lets the stack assign one. The assigned PSM is written to the returned fd
    /// as a 4-byte little-endian value once the server is up. The returned id names the
    /// listener for as long as it lives, accepts included.
    pub fn listen(
        &self,
        name: &str,
        uuid: Option<Uuid>,
        psm: u16,
        flags: i32,
    ) -> Result<(SlotId, OwnedFd), SockError> {
        let security = SecurityMask::from_sock_flags(flags);
        let mut table = self.lock_table();
        let (index, app_fd) = self.alloc_slot(
            &mut table,
            NewSlot {
                name,
                uuid,
                psm,
                addr: RawAddress::empty(),
                server: true,
                security,
            },
        )?;
        let (id, stack_id) = (table.slots[index].id, table.slots[index].stack_id);

        let requested = match uuid {
            Some(uuid) if flags & SOCK_FLAG_NO_SDP == 0 => {
                self.stack.create_sdp_record(stack_id, name, uuid)
            }
            _ => self.stack.start_server(stack_id, psm, security),
        };
        if let Err(e) = requested {
            tracing::warn!(slot = %id, error = %e, "L2CAP listen rejected by stack");
            self.free_slot(&mut table, index);
            return Err(e.into());
        }

        tracing::debug!(slot = %id, name, psm, "L2CAP listen requested");
        Ok((id, app_fd))
    }

    /// Connect to `addr`, on `psm` directly or, when `psm == 0`, on the PSM found by
    /// discovering `uuid`. The PSM is written to the returned fd once the channel is open.
    pub fn connect(
        &self,
        addr: RawAddress,
        uuid: Option<Uuid>,
        psm: u16,
        flags: i32,
    ) -> Result<(SlotId, OwnedFd), SockError> {
        if addr.is_empty() {
            return Err(SockError::InvalidParam("addr"));
        }
        let discover_uuid = match (psm, uuid) {
            (0, None) => return Err(SockError::InvalidParam("uuid")),
            (0, Some(uuid)) => Some(uuid),
            _ => None,
        };

        let security = SecurityMask::from_sock_flags(flags);
        let mut table = self.lock_table();
        let (index, app_fd) = self.alloc_slot(
            &mut table,
            NewSlot {
                name: "",
                uuid,
                psm,
                addr,
                server: false,
                security,
            },
        )?;
        let (id, stack_id) = (table.slots[index].id, table.slots[index].stack_id);

        let requested = match discover_uuid {
            None => self.stack.connect(stack_id, psm, security, addr),
            Some(uuid) if table.sdp_busy => {
                table.slots[index].sdp_pending = true;
                tracing::debug!(slot = %id, %uuid, "Service discovery queued");
                Ok(())
            }
            Some(uuid) => self.start_discovery(&mut table, index, uuid),
        };
        if let Err(e) = requested {
            tracing::warn!(slot = %id, error = %e, "L2CAP connect rejected by stack");
            self.free_slot(&mut table, index);
            return Err(e.into());
        }

        tracing::debug!(slot = %id, %addr, psm, "L2CAP connect requested");
        Ok((id, app_fd))
    }

    /// Release the slot `listen()` or `connect()` returned `id` for.
    pub fn disconnect(&self, id: SlotId) -> Result<(), SockError> {
        let mut table = self.lock_table();
        let index = table.find(id).ok_or(SockError::UnknownSlot(id))?;
        self.free_slot(&mut table, index);
        Ok(())
    }

    /// Release every slot and stop the poll thread. Later requests fail.
    pub fn cleanup(&self) {
        {
            let mut table = self.lock_table();
            if table.stopped {
                return;
            }
            for index in 0..table.slots.len() {
                self.free_slot(&mut table, index);
            }
            table.stopped = true;
        }

        // The table lock must be released before joining: the poll thread may be waiting on it.
        if let Err(e) = self.pool.exit(self.poll) {
            tracing::debug!(poll = %self.poll, error = %e, "Poll thread already stopped");
        }
        tracing::debug!("L2CAP socket table cleaned up");
    }

    /// In-use slots ordered by id.
    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        let table = self.lock_table();
        let mut slots: Vec<SlotSnapshot> = table
            .slots
            .iter()
            .filter(|s| s.in_use)
            .map(L2capSlot::snapshot)
            .collect();
        slots.sort_by_key(|s| s.id);
        slots
    }

    pub fn dump(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.snapshot())
    }

    pub fn in_use(&self) -> usize {
        self.lock_table().slots.iter().filter(|s| s.in_use).count()
    }

    pub fn poll_handle(&self) -> PollHandle {
        self.poll
    }

    /// Entry point for stack notifications. Events are matched on stack id.
    pub fn on_stack_event(&self, event: StackEvent) {
        let mut table = self.lock_table();
        if table.stopped {
            tracing::debug!(stack_id = %event.id(), "Stack event after cleanup");
            return;
        }

        if let StackEvent::DiscoveryComplete { id, status, psm } = event {
            self.on_discovery_complete(&mut table, id, status, psm);
            return;
        }

        let stack_id = event.id();
        let Some(index) = table.find_stack(stack_id) else {
            tracing::warn!(%stack_id, ?event, "Stack event for unknown slot");
            return;
        };
        let id = table.slots[index].id;

        match event {
            StackEvent::SdpRecordCreated { record, .. } => {
                let slot = &mut table.slots[index];
                slot.sdp_record = Some(record);
                let (psm, security) = (slot.psm, slot.security);
                if let Err(e) = self.stack.start_server(stack_id, psm, security) {
                    tracing::warn!(slot = %id, error = %e, "Failed to start L2CAP server");
                    self.free_slot(&mut table, index);
                }
            }
            StackEvent::ServerStarted {
                status,
                handle,
                psm,
                ..
            } => self.on_server_started(&mut table, index, status, handle, psm),
            StackEvent::ClientInit { status, handle, .. } => {
                if status.is_success() {
                    table.slots[index].handle = Some(handle);
                } else {
                    tracing::warn!(slot = %id, %status, "L2CAP client init failed");
                    self.free_slot(&mut table, index);
                }
            }
            StackEvent::Open {
                status,
                handle,
                addr,
                tx_mtu,
                ..
            } => self.on_open(&mut table, index, status, handle, addr, tx_mtu),
            StackEvent::IncomingOpen {
                handle,
                addr,
                tx_mtu,
                ..
            } => self.on_incoming_open(&mut table, index, handle, addr, tx_mtu),
            StackEvent::Closed { .. } => {
                // The stack already closed the channel.
                table.slots[index].handle = None;
                tracing::debug!(slot = %id, "L2CAP channel closed by stack");
                self.free_slot(&mut table, index);
            }
            StackEvent::Congestion { congested, .. } => {
                let slot = &mut table.slots[index];
                slot.congested = congested;
                tracing::trace!(slot = %id, congested, "L2CAP congestion changed");
                if !congested && slot.connected {
                    self.watch(slot, PollFlags::READ | PollFlags::EXCEPTION);
                }
            }
            StackEvent::Data { data, .. } => self.deliver_to_app(&mut table, index, data),
            StackEvent::DiscoveryComplete { .. } => {}
        }
    }

    fn on_server_started(
        &self,
        table: &mut SlotTable,
        index: usize,
        status: BtStatus,
        handle: StackHandle,
        psm: u16,
    ) {
        let slot = &mut table.slots[index];
        let id = slot.id;
        if !status.is_success() {
            tracing::warn!(slot = %id, %status, "L2CAP server failed to start");
            self.free_slot(table, index);
            return;
        }

        slot.handle = Some(handle);
        slot.psm = psm;
        if !slot.psm_sent {
            let sent = match slot.our_fd.as_ref() {
                Some(fd) => handoff::send_channel(fd.as_fd(), i32::from(psm)),
                None => Ok(()),
            };
            if let Err(e) = sent {
                tracing::warn!(slot = %id, error = %e, "Failed to send PSM to app");
                self.free_slot(table, index);
                return;
            }
            slot.psm_sent = true;
        }

        tracing::debug!(slot = %id, psm, %handle, "L2CAP server listening");
        // Accepts arrive as stack events; only watch for the app closing its end.
        self.watch(slot, PollFlags::EXCEPTION);
    }

    fn on_open(
        &self,
        table: &mut SlotTable,
        index: usize,
        status: BtStatus,
        handle: StackHandle,
        addr: RawAddress,
        tx_mtu: u16,
    ) {
        let slot = &mut table.slots[index];
        let id = slot.id;
        if !status.is_success() {
            tracing::warn!(slot = %id, %status, "L2CAP connection failed");
            self.free_slot(table, index);
            return;
        }

        slot.handle = Some(handle);
        slot.addr = addr;
        slot.tx_mtu = tx_mtu;
        slot.connected = true;

        let sent = match slot.our_fd.as_ref() {
            Some(fd) => handoff::send_channel(fd.as_fd(), i32::from(slot.psm)),
            None => Ok(()),
        };
        if let Err(e) = sent {
            tracing::warn!(slot = %id, error = %e, "Failed to send PSM to app");
            self.free_slot(table, index);
            return;
        }

        tracing::debug!(slot = %id, %addr, psm = slot.psm, "L2CAP connection open");
        self.watch(slot, PollFlags::READ | PollFlags::EXCEPTION);
    }

    fn on_incoming_open(
        &self,
        table: &mut SlotTable,
        listener: usize,
        handle: StackHandle,
        addr: RawAddress,
        tx_mtu: u16,
    ) {
        let (name, uuid, psm, security) = {
            let slot = &table.slots[listener];
            if !slot.server {
                tracing::warn!(slot = %slot.id, "Incoming connection on a non-listening slot");
                return;
            }
            (slot.name.clone(), slot.uuid, slot.psm, slot.security)
        };

        let (accepted, app_fd) = match self.alloc_slot(
            table,
            NewSlot {
                name: &name,
                uuid,
                psm,
                addr,
                server: false,
                security,
            },
        ) {
            Ok(allocated) => allocated,
            Err(e) => {
                tracing::error!(slot = %table.slots[listener].id, error = %e, "Cannot accept L2CAP connection");
                return;
            }
        };

        // The connection inherits the listen handle; the listener gets a new one on re-listen.
        let listen_handle = table.slots[listener].handle.take();
        {
            let slot = &mut table.slots[accepted];
            slot.handle = listen_handle.or(Some(handle));
            slot.tx_mtu = tx_mtu;
            slot.connected = true;
        }

        let fresh_stack_id = table.slots[accepted].stack_id;
        table.slots[accepted].stack_id = table.slots[listener].stack_id;
        table.slots[listener].stack_id = fresh_stack_id;
        let (listener_id, accepted_id) = (table.slots[listener].id, table.slots[accepted].id);
        tracing::debug!(
            listener = %listener_id,
            connection = %accepted_id,
            relisten_stack_id = %fresh_stack_id,
            %addr,
            "Accepted L2CAP connection"
        );

        self.watch(&mut table.slots[listener], PollFlags::EXCEPTION);
        self.watch(
            &mut table.slots[accepted],
            PollFlags::READ | PollFlags::EXCEPTION,
        );

        let signal = ConnectSignal {
            addr,
            channel: i32::from(psm),
            status: 0,
            max_tx_packet_size: tx_mtu,
            max_rx_packet_size: DEFAULT_MTU,
        };
        let sent = match table.slots[listener].our_fd.as_ref() {
            Some(fd) => handoff::send_fd(fd.as_fd(), &signal.to_bytes(), app_fd.as_fd()).map(|_| ()),
            None => Err(io::Error::other("listener socket closed")),
        };
        // Our copy of the app end is no longer needed once it has been passed on.
        drop(app_fd);
        if let Err(e) = sent {
            tracing::warn!(slot = %accepted_id, error = %e, "Failed to hand accepted socket to app");
            self.free_slot(table, accepted);
        }

        if let Err(e) = self.stack.start_server(fresh_stack_id, psm, security) {
            tracing::warn!(slot = %listener_id, error = %e, "Failed to restart L2CAP server");
            self.free_slot(table, listener);
        }
    }

    fn on_discovery_complete(
        &self,
        table: &mut SlotTable,
        stack_id: SlotId,
        status: BtStatus,
        psm: u16,
    ) {
        table.sdp_busy = false;

        match table.find_stack(stack_id) {
            Some(index) if table.slots[index].doing_sdp => {
                let slot = &mut table.slots[index];
                let id = slot.id;
                slot.doing_sdp = false;
                if status.is_success() && psm != 0 {
                    slot.psm = psm;
                    let (addr, security) = (slot.addr, slot.security);
                    tracing::debug!(slot = %id, psm, "Service discovery resolved PSM");
                    if let Err(e) = self.stack.connect(stack_id, psm, security, addr) {
                        tracing::warn!(slot = %id, error = %e, "L2CAP connect rejected by stack");
                        self.free_slot(table, index);
                    }
                } else {
                    tracing::warn!(slot = %id, %status, psm, "Service discovery failed");
                    self.free_slot(table, index);
                }
            }
            _ => tracing::debug!(%stack_id, "Discovery result for released slot"),
        }

        self.start_next_discovery(table);
    }

    fn start_discovery(
        &self,
        table: &mut SlotTable,
        index: usize,
        uuid: Uuid,
    ) -> Result<(), StackError> {
        let slot = &mut table.slots[index];
        slot.sdp_pending = false;
        slot.doing_sdp = true;
        let (id, stack_id, addr) = (slot.id, slot.stack_id, slot.addr);

        if let Err(e) = self.stack.discover(stack_id, addr, uuid) {
            slot.doing_sdp = false;
            return Err(e);
        }
        table.sdp_busy = true;
        tracing::debug!(slot = %id, %addr, %uuid, "Service discovery started");
        Ok(())
    }

    /// Start the pending discovery with the lowest slot id, if any.
    fn start_next_discovery(&self, table: &mut SlotTable) {
        while !table.sdp_busy {
            let Some((index, uuid)) = table
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.in_use && s.sdp_pending)
                .min_by_key(|(_, s)| s.id)
                .map(|(index, s)| (index, s.uuid))
            else {
                return;
            };

            let started = match uuid {
                Some(uuid) => self.start_discovery(table, index, uuid),
                None => Err(StackError::Failed("no service uuid".into())),
            };
            if let Err(e) = started {
                tracing::warn!(slot = %table.slots[index].id, error = %e, "Failed to start queued discovery");
                self.free_slot(table, index);
            }
        }
    }

    fn on_signaled(&self, event: PollEvent) {
        let Some(id) = SlotId::from_raw(event.user_id) else {
            tracing::warn!(user_id = event.user_id, "Poll event with foreign id");
            return;
        };

        let mut table = self.lock_table();
        let Some(index) = table
            .find(id)
            .filter(|&index| table.slots[index].our_raw_fd() == Some(event.fd))
        else {
            tracing::trace!(slot = %id, fd = event.fd, "Poll event for released slot");
            return;
        };

        // Only bits this slot armed count; anything else was registered by an earlier
        // owner of the same fd number and id.
        let slot = &mut table.slots[index];
        if slot.armed.is_empty() {
            tracing::trace!(slot = %id, fd = event.fd, flags = ?event.flags, "Poll event for unarmed slot");
            return;
        }
        let flags = event.flags & (slot.armed | PollFlags::EXCEPTION);
        if flags.intersects(PollFlags::EXCEPTION) {
            slot.armed = PollFlags::NONE;
        } else {
            slot.armed.remove(flags);
        }
        let mut drop_slot = false;

        if flags.contains(PollFlags::READ) && !table.slots[index].server {
            if table.slots[index].connected {
                let readable = !flags.contains(PollFlags::EXCEPTION)
                    || matches!(self.pending(&table, index), Ok(n) if n > 0);
                if readable {
                    if let Err(e) = self.forward_to_stack(&mut table, index) {
                        tracing::warn!(slot = %id, error = %e, "Failed to forward app data");
                        drop_slot = true;
                    }
                }
            } else {
                drop_slot = true;
            }
        }

        if flags.contains(PollFlags::WRITE) && !drop_slot {
            match self.flush_to_app(&mut table, index) {
                Ok(true) => {
                    self.watch(
                        &mut table.slots[index],
                        PollFlags::WRITE | PollFlags::ADD_SYNC,
                    );
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(slot = %id, error = %e, "Failed to send queued data to app");
                    drop_slot = true;
                }
            }
        }

        if drop_slot || flags.contains(PollFlags::EXCEPTION) {
            // Keep the slot while the app's last writes are still unread.
            let remaining = self.pending(&table, index).unwrap_or(0);
            if drop_slot || remaining == 0 {
                self.free_slot(&mut table, index);
            }
        }
    }

    fn pending(&self, table: &SlotTable, index: usize) -> io::Result<usize> {
        match table.slots[index].our_fd.as_ref() {
            Some(fd) => handoff::pending_bytes(fd.as_fd()),
            None => Ok(0),
        }
    }

    /// Read one packet from our end and hand it to the stack.
    fn forward_to_stack(&self, table: &mut SlotTable, index: usize) -> io::Result<()> {
        let slot = &mut table.slots[index];
        let (id, stack_id) = (slot.id, slot.stack_id);
        let (Some(fd), Some(handle)) = (slot.our_fd.as_ref(), slot.handle) else {
            return Ok(());
        };

        let size = handoff::pending_bytes(fd.as_fd())?;
        let mut buf = BytesMut::zeroed(size.max(usize::from(DEFAULT_MTU)));
        let n = match handoff::recv_nonblocking(fd.as_fd(), &mut buf) {
            Ok(n) => n,
            Err(e) if would_block(&e) => {
                self.watch(slot, PollFlags::READ | PollFlags::ADD_SYNC);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        buf.truncate(n);

        let status = if n == 0 {
            WriteStatus::Sent
        } else {
            self.stack
                .write(handle, stack_id, buf.freeze())
                .map_err(io::Error::other)?
        };
        tracing::trace!(slot = %id, bytes = n, ?status, "App data sent to stack");

        match status {
            WriteStatus::Sent if !slot.congested => {
                self.watch(slot, PollFlags::READ | PollFlags::ADD_SYNC);
            }
            WriteStatus::Sent => {}
            WriteStatus::Congested => slot.congested = true,
        }
        Ok(())
    }

    /// Drain queued stack data into our end. Returns whether data is still queued.
    fn flush_to_app(&self, table: &mut SlotTable, index: usize) -> io::Result<bool> {
        let slot = &mut table.slots[index];
        match slot.our_fd.as_ref() {
            Some(fd) => drain_queue(fd.as_fd(), &mut slot.to_app),
            None => Ok(false),
        }
    }

    fn deliver_to_app(&self, table: &mut SlotTable, index: usize, mut data: Bytes) {
        let slot = &mut table.slots[index];
        let id = slot.id;
        if !slot.connected {
            tracing::warn!(slot = %id, bytes = data.len(), "Dropping data for unconnected slot");
            return;
        }
        let Some(fd) = slot.our_fd.as_ref() else {
            return;
        };

        if !slot.to_app.is_empty() {
            // Write readiness is already armed for the queue.
            slot.to_app.push_back(data);
            return;
        }

        match handoff::send_nonblocking(fd.as_fd(), &data) {
            Ok(n) if n >= data.len() => {}
            Ok(n) => {
                data.advance(n);
                slot.to_app.push_back(data);
                self.watch(slot, PollFlags::WRITE);
            }
            Err(e) if would_block(&e) => {
                slot.to_app.push_back(data);
                self.watch(slot, PollFlags::WRITE);
            }
            Err(e) => {
                tracing::warn!(slot = %id, error = %e, "Failed to send stack data to app");
                self.free_slot(table, index);
            }
        }
    }

    fn watch(&self, slot: &mut L2capSlot, flags: PollFlags) {
        let Some(fd) = slot.our_raw_fd() else {
            return;
        };
        match self
            .pool
            .add_fd(self.poll, fd, SocketType::L2cap, flags, slot.id.as_u32())
        {
            Ok(()) => slot.armed |= flags.interest(),
            Err(e) => {
                tracing::warn!(slot = %slot.id, fd, error = %e, "Failed to watch L2CAP socket")
            }
        }
    }

    fn alloc_slot(
        &self,
        table: &mut SlotTable,
        new: NewSlot<'_>,
    ) -> Result<(usize, OwnedFd), SockError> {
        if table.stopped {
            return Err(SockError::ThreadStopped(self.poll));
        }
        let Some(index) = table.free.pop_front() else {
            tracing::error!(max = table.slots.len(), "No free L2CAP socket slot");
            return Err(SockError::NoFreeSlot);
        };

        let (ours, app) = match handoff::slot_socket_pair() {
            Ok(pair) => pair,
            Err(e) => {
                table.free.push_front(index);
                tracing::error!(error = %e, "Failed to create socket pair");
                return Err(e.into());
            }
        };

        let slot = &mut table.slots[index];
        slot.in_use = true;
        slot.server = new.server;
        slot.name = new.name.to_string();
        slot.uuid = new.uuid;
        slot.psm = new.psm;
        slot.addr = new.addr;
        slot.security = new.security;
        slot.our_fd = Some(ours);

        tracing::debug!(slot = %slot.id, stack_id = %slot.stack_id, server = new.server, "L2CAP slot allocated");
        Ok((index, app))
    }

    /// Tear a slot down. Safe to call on a slot that is already free.
    fn free_slot(&self, table: &mut SlotTable, index: usize) {
        let slot = &mut table.slots[index];
        if !slot.in_use {
            return;
        }
        let (id, stack_id) = (slot.id, slot.stack_id);

        if slot.server {
            if let Some(handle) = slot.handle.take() {
                self.stack.stop_server(handle);
            }
        }
        // Unregister before closing: the fd number is reused by the next socket pair.
        if let Some(fd) = slot.our_raw_fd() {
            if let Err(e) = self.pool.remove_fd(self.poll, fd) {
                tracing::debug!(slot = %id, fd, error = %e, "Failed to unwatch L2CAP socket");
            }
        }
        slot.our_fd = None;
        if let Some(record) = slot.sdp_record.take() {
            self.stack.remove_sdp_record(record);
        }
        if let Some(handle) = slot.handle.take() {
            self.stack.close(handle);
        }
        *slot = L2capSlot::vacant(id, stack_id);
        table.free.push_back(index);

        tracing::debug!(slot = %id, "L2CAP slot freed");
    }

    fn lock_table(&self) -> MutexGuard<'_, SlotTable> {
        match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("L2CAP slot table mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl Drop for L2capSockets {
    fn drop(&mut self) {
        self.cleanup();
    }
}
