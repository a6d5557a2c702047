//! Poll thread pool.
//!
//! Each pool entry is a dedicated OS thread blocking in `poll(2)` over a bounded set of fds.
//! Readiness is reported through a signaled callback; other threads change a thread's fd
//! set by posting commands.
//!
//! Command delivery: commands go through an mpsc channel and a byte on a wake socket. The
//! wake socket always occupies poll slot 0 and is serviced before any data fd in the same
//! wake cycle, so an fd added by a command is only observed from the next `poll` onwards.
//!
//! Re-arming: when an fd fires, the bits that fired are cleared from its interest set
//! before the callback runs (the whole entry is dropped on exception, or once no interest
//! bits remain). Callers that want more events re-add interest, typically from inside the
//! callback with `ADD_SYNC`. An fd is unregistered with `remove_fd` before it is closed, so
//! the next socket that gets the same fd number starts from a clean registration.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};

use tokio::sync::mpsc;

use crate::config::SockConfig;
use crate::ids::PollHandle;
use crate::sock::error::SockError;
use crate::types::SocketType;

/// Interest / readiness bits for a monitored fd.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PollFlags(u32);

impl PollFlags {
    pub const NONE: PollFlags = PollFlags(0);
    pub const READ: PollFlags = PollFlags(1 << 0);
    pub const WRITE: PollFlags = PollFlags(1 << 1);
    pub const EXCEPTION: PollFlags = PollFlags(1 << 2);
    /// One-shot request flag: apply an `add_fd` immediately when called on the poll thread.
    pub const ADD_SYNC: PollFlags = PollFlags(1 << 3);

    const INTEREST: u32 = Self::READ.0 | Self::WRITE.0 | Self::EXCEPTION.0;

    pub fn contains(&self, other: PollFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn intersects(&self, other: PollFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn remove(&mut self, other: PollFlags) {
        self.0 &= !other.0;
    }

    pub(crate) fn interest(self) -> PollFlags {
        PollFlags(self.0 & Self::INTEREST)
    }

    fn to_events(self) -> libc::c_short {
        let mut events = 0;
        if self.intersects(Self::READ) {
            events |= libc::POLLIN;
        }
        if self.intersects(Self::WRITE) {
            events |= libc::POLLOUT;
        }
        if self.intersects(Self::EXCEPTION) {
            events |= libc::POLLRDHUP;
        }
        events
    }

    fn from_revents(revents: libc::c_short) -> PollFlags {
        let mut flags = PollFlags::NONE;
        if revents & libc::POLLIN != 0 {
            flags |= PollFlags::READ;
        }
        if revents & libc::POLLOUT != 0 {
            flags |= PollFlags::WRITE;
        }
        if revents & (libc::POLLHUP | libc::POLLRDHUP | libc::POLLERR | libc::POLLNVAL) != 0 {
            flags |= PollFlags::EXCEPTION;
        }
        flags
    }
}

impl BitOr for PollFlags {
    type Output = PollFlags;

    fn bitor(self, rhs: PollFlags) -> PollFlags {
        PollFlags(self.0 | rhs.0)
    }
}

impl BitAnd for PollFlags {
    type Output = PollFlags;

    fn bitand(self, rhs: PollFlags) -> PollFlags {
        PollFlags(self.0 & rhs.0)
    }
}

impl BitOrAssign for PollFlags {
    fn bitor_assign(&mut self, rhs: PollFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for PollFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (PollFlags::READ, "READ"),
            (PollFlags::WRITE, "WRITE"),
            (PollFlags::EXCEPTION, "EXCEPTION"),
            (PollFlags::ADD_SYNC, "ADD_SYNC"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", set.join("|"))
        }
    }
}

/// Readiness report for one monitored fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvent {
    pub handle: PollHandle,
    pub fd: RawFd,
    pub sock_type: SocketType,
    pub flags: PollFlags,
    pub user_id: u32,
}

/// Application-defined command delivered on the poll thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollCommand {
    pub handle: PollHandle,
    pub cmd_type: i32,
    pub payload: Vec<u8>,
    pub user_id: u32,
}

pub type SignaledCallback = Arc<dyn Fn(PollEvent) + Send + Sync>;
pub type CommandCallback = Arc<dyn Fn(PollCommand) + Send + Sync>;

enum Command {
    AddFd {
        fd: RawFd,
        sock_type: SocketType,
        flags: PollFlags,
        user_id: u32,
    },
    RemoveFd {
        fd: RawFd,
    },
    Wakeup,
    User {
        cmd_type: i32,
        payload: Vec<u8>,
        user_id: u32,
    },
    Exit,
}

#[derive(Debug, Clone, Copy)]
struct PollSlot {
    fd: RawFd,
    user_id: u32,
    sock_type: SocketType,
    flags: PollFlags,
}

/// Thread state shared between the poll loop and posting threads.
struct Shared {
    handle: PollHandle,
    /// Data slots. The wake socket is slot 0 and is not stored here.
    slots: Mutex<Vec<PollSlot>>,
    max_data_slots: usize,
    cmd_tx: mpsc::UnboundedSender<Command>,
    wake_tx: UnixStream,
    thread_id: OnceLock<ThreadId>,
    on_signaled: SignaledCallback,
    on_command: CommandCallback,
}

impl Shared {
    fn lock_slots(&self) -> MutexGuard<'_, Vec<PollSlot>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(handle = %self.handle, "Poll slot table mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    fn on_poll_thread(&self) -> bool {
        self.thread_id.get() == Some(&thread::current().id())
    }

    fn post(&self, cmd: Command) -> Result<(), SockError> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| SockError::ThreadStopped(self.handle))?;
        match (&self.wake_tx).write(&[1]) {
            Ok(_) => Ok(()),
            // A full wake socket already guarantees a pending wakeup.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(SockError::Io(e)),
        }
    }

    fn add_poll(&self, fd: RawFd, sock_type: SocketType, flags: PollFlags, user_id: u32) {
        let flags = flags.interest();
        let mut slots = self.lock_slots();

        if let Some(slot) = slots.iter_mut().find(|s| s.fd == fd) {
            if slot.sock_type != SocketType::Unknown && slot.sock_type != sock_type {
                tracing::warn!(
                    handle = %self.handle,
                    fd,
                    was = ?slot.sock_type,
                    now = ?sock_type,
                    "Poll socket type changed"
                );
            }
            slot.sock_type = sock_type;
            slot.user_id = user_id;
            slot.flags |= flags;
            return;
        }

        if slots.len() >= self.max_data_slots {
            tracing::error!(
                handle = %self.handle,
                fd,
                max = self.max_data_slots,
                "Exceeded max poll slots - dropping add"
            );
            return;
        }

        slots.push(PollSlot {
            fd,
            user_id,
            sock_type,
            flags,
        });
    }

    fn remove_poll(&self, fd: RawFd) {
        let mut slots = self.lock_slots();
        let before = slots.len();
        slots.retain(|s| s.fd != fd);
        if slots.len() != before {
            tracing::trace!(handle = %self.handle, fd, "Poll fd removed");
        }
    }

    /// Clear the bits that fired; drop the entry on exception or once nothing is left.
    fn consume(&self, fd: RawFd, revents: libc::c_short) -> Option<PollEvent> {
        let mut slots = self.lock_slots();
        let index = slots.iter().position(|s| s.fd == fd)?;
        let fired = PollFlags::from_revents(revents);
        if fired.is_empty() {
            return None;
        }

        let slot = &mut slots[index];
        let event = PollEvent {
            handle: self.handle,
            fd,
            sock_type: slot.sock_type,
            flags: fired,
            user_id: slot.user_id,
        };

        if fired.intersects(PollFlags::EXCEPTION) {
            slots.remove(index);
        } else {
            slot.flags.remove(fired);
            if slot.flags.is_empty() {
                slots.remove(index);
            }
        }

        Some(event)
    }
}

struct PollThread {
    shared: Arc<Shared>,
    join: Option<JoinHandle<()>>,
}

struct PoolState {
    threads: Vec<Option<PollThread>>,
    free: VecDeque<usize>,
}

/// Pool of poll threads with a fixed number of entries.
pub struct PollThreadPool {
    state: Mutex<PoolState>,
    max_fds_per_thread: usize,
}

impl PollThreadPool {
    pub fn new(config: &SockConfig) -> Self {
        let max_threads = config.max_poll_threads;
        Self {
            state: Mutex::new(PoolState {
                threads: (0..max_threads).map(|_| None).collect(),
                free: (0..max_threads).collect(),
            }),
            max_fds_per_thread: config.max_fds_per_thread.max(2),
        }
    }

    /// Start a poll thread. Fails when the pool is full or the thread cannot be set up.
    pub fn create<S, C>(&self, on_signaled: S, on_command: C) -> Result<PollHandle, SockError>
    where
        S: Fn(PollEvent) + Send + Sync + 'static,
        C: Fn(PollCommand) + Send + Sync + 'static,
    {
        let mut state = self.lock_state();
        let Some(index) = state.free.pop_front() else {
            tracing::error!("No free poll thread slot");
            return Err(SockError::NoFreeThread);
        };

        match self.spawn(PollHandle::new(index), Arc::new(on_signaled), Arc::new(on_command)) {
            Ok(thread) => {
                state.threads[index] = Some(thread);
                tracing::debug!(handle = %PollHandle::new(index), "Poll thread created");
                Ok(PollHandle::new(index))
            }
            Err(e) => {
                state.free.push_front(index);
                tracing::error!(error = %e, "Failed to start poll thread");
                Err(e)
            }
        }
    }

    /// Register `fd` or add interest bits to an existing registration.
    ///
    /// With `ADD_SYNC` and when called on the target poll thread itself, the table is updated
    /// before returning. Otherwise the change is applied on the thread's next wake.
    pub fn add_fd(
        &self,
        handle: PollHandle,
        fd: RawFd,
        sock_type: SocketType,
        flags: PollFlags,
        user_id: u32,
    ) -> Result<(), SockError> {
        if fd < 0 {
            return Err(SockError::InvalidParam("fd"));
        }
        let shared = self.shared(handle)?;

        if flags.intersects(PollFlags::ADD_SYNC) {
            if shared.on_poll_thread() {
                shared.add_poll(fd, sock_type, flags, user_id);
                return Ok(());
            }
            tracing::debug!(%handle, fd, "ADD_SYNC off the poll thread, falling back to async");
        }

        shared.post(Command::AddFd {
            fd,
            sock_type,
            flags,
            user_id,
        })
    }

    /// Stop monitoring `fd`. Must be called before the fd is closed so a later registration
    /// of the same fd number starts from an empty interest set.
    ///
    /// Applied immediately on the poll thread itself, otherwise queued ahead of any later
    /// `add_fd` from the same caller.
    pub fn remove_fd(&self, handle: PollHandle, fd: RawFd) -> Result<(), SockError> {
        if fd < 0 {
            return Err(SockError::InvalidParam("fd"));
        }
        let shared = self.shared(handle)?;
        if shared.on_poll_thread() {
            shared.remove_poll(fd);
            return Ok(());
        }
        shared.post(Command::RemoveFd { fd })
    }

    /// Break the thread out of `poll` without doing anything else.
    pub fn wakeup(&self, handle: PollHandle) -> Result<(), SockError> {
        self.shared(handle)?.post(Command::Wakeup)
    }

    /// Deliver an application command to the thread's command callback.
    pub fn post_cmd(
        &self,
        handle: PollHandle,
        cmd_type: i32,
        payload: &[u8],
        user_id: u32,
    ) -> Result<(), SockError> {
        self.shared(handle)?.post(Command::User {
            cmd_type,
            payload: payload.to_vec(),
            user_id,
        })
    }

    /// Stop the thread, wait for it, and free its pool entry.
    ///
    /// Called from the poll thread itself, the thread is told to exit but not joined.
    pub fn exit(&self, handle: PollHandle) -> Result<(), SockError> {
        let thread = {
            let mut state = self.lock_state();
            let entry = state
                .threads
                .get_mut(handle.index())
                .ok_or(SockError::InvalidHandle(handle))?;
            let thread = entry.take().ok_or(SockError::InvalidHandle(handle))?;
            state.free.push_back(handle.index());
            thread
        };

        Self::stop(thread);
        tracing::debug!(%handle, "Poll thread exited");
        Ok(())
    }

    /// Number of data fds currently monitored by `handle` (the command slot not included).
    pub fn poll_count(&self, handle: PollHandle) -> Result<usize, SockError> {
        Ok(self.shared(handle)?.lock_slots().len())
    }

    /// Interest bits currently registered for `fd`.
    pub fn interest(&self, handle: PollHandle, fd: RawFd) -> Result<Option<PollFlags>, SockError> {
        Ok(self
            .shared(handle)?
            .lock_slots()
            .iter()
            .find(|s| s.fd == fd)
            .map(|s| s.flags))
    }

    pub fn running(&self) -> usize {
        self.lock_state().threads.iter().filter(|t| t.is_some()).count()
    }

    fn spawn(
        &self,
        handle: PollHandle,
        on_signaled: SignaledCallback,
        on_command: CommandCallback,
    ) -> Result<PollThread, SockError> {
        let (wake_tx, wake_rx) = UnixStream::pair()?;
        wake_tx.set_nonblocking(true)?;
        wake_rx.set_nonblocking(true)?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            handle,
            slots: Mutex::new(Vec::with_capacity(self.max_fds_per_thread - 1)),
            max_data_slots: self.max_fds_per_thread - 1,
            cmd_tx,
            wake_tx,
            thread_id: OnceLock::new(),
            on_signaled,
            on_command,
        });

        let loop_shared = Arc::clone(&shared);
        let join = thread::Builder::new()
            .name(format!("btif-sock-{}", handle.index()))
            .spawn(move || run_poll_loop(loop_shared, wake_rx, cmd_rx))?;

        Ok(PollThread {
            shared,
            join: Some(join),
        })
    }

    fn stop(mut thread: PollThread) {
        if let Err(e) = thread.shared.post(Command::Exit) {
            tracing::debug!(handle = %thread.shared.handle, error = %e, "Poll thread already gone");
        }
        if thread.shared.on_poll_thread() {
            return;
        }
        if let Some(join) = thread.join.take() {
            if join.join().is_err() {
                tracing::error!(handle = %thread.shared.handle, "Poll thread panicked");
            }
        }
    }

    fn shared(&self, handle: PollHandle) -> Result<Arc<Shared>, SockError> {
        self.lock_state()
            .threads
            .get(handle.index())
            .and_then(|t| t.as_ref())
            .map(|t| Arc::clone(&t.shared))
            .ok_or(SockError::InvalidHandle(handle))
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Poll pool mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl Drop for PollThreadPool {
    fn drop(&mut self) {
        let threads: Vec<PollThread> = {
            let mut state = self.lock_state();
            state.threads.iter_mut().filter_map(|t| t.take()).collect()
        };
        for thread in threads {
            Self::stop(thread);
        }
    }
}

fn run_poll_loop(
    shared: Arc<Shared>,
    mut wake_rx: UnixStream,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) {
    let _ = shared.thread_id.set(thread::current().id());
    let handle = shared.handle;
    tracing::debug!(%handle, "Poll thread started");

    let mut pfds: Vec<libc::pollfd> = Vec::with_capacity(shared.max_data_slots + 1);
    let mut removed: Vec<RawFd> = Vec::new();

    'poll: loop {
        pfds.clear();
        pfds.push(libc::pollfd {
            fd: wake_rx.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        pfds.extend(shared.lock_slots().iter().map(|slot| libc::pollfd {
            fd: slot.fd,
            events: slot.flags.to_events(),
            revents: 0,
        }));

        let ret = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, -1) };
        if ret < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(%handle, error = %e, "poll failed - poll thread exiting");
            break;
        }
        if ret == 0 {
            continue;
        }

        // Readiness of an fd removed in this cycle belongs to its previous owner.
        removed.clear();
        if pfds[0].revents != 0 {
            drain_wake(&mut wake_rx);
            while let Ok(cmd) = cmd_rx.try_recv() {
                match cmd {
                    Command::AddFd {
                        fd,
                        sock_type,
                        flags,
                        user_id,
                    } => shared.add_poll(fd, sock_type, flags, user_id),
                    Command::RemoveFd { fd } => {
                        shared.remove_poll(fd);
                        removed.push(fd);
                    }
                    Command::Wakeup => {}
                    Command::User {
                        cmd_type,
                        payload,
                        user_id,
                    } => (shared.on_command)(PollCommand {
                        handle,
                        cmd_type,
                        payload,
                        user_id,
                    }),
                    Command::Exit => break 'poll,
                }
            }
        }

        for pfd in pfds
            .iter()
            .skip(1)
            .filter(|p| p.revents != 0 && !removed.contains(&p.fd))
        {
            if let Some(event) = shared.consume(pfd.fd, pfd.revents) {
                tracing::trace!(%handle, fd = event.fd, flags = ?event.flags, user_id = event.user_id, "fd signaled");
                (shared.on_signaled)(event);
            }
        }
    }

    tracing::debug!(%handle, "Poll thread stopped");
}

fn drain_wake(wake_rx: &mut UnixStream) {
    let mut buf = [0u8; 64];
    loop {
        match wake_rx.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}
