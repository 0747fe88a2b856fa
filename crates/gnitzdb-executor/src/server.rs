//! The single-threaded event loop: one `SOCK_SEQPACKET` listening
//! socket, its connected clients multiplexed with `poll`, and on every
//! ingested delta an ingest + cascade + broadcast pass [spec §5 "Server
//! loop", §6 "IPC protocol"].
//!
//! Grounded on `gnitz/server/executor.py`'s `ServerExecutor`:
//! non-blocking accept and client sockets, a 500ms poll timeout so a
//! shutdown flag is observed between ticks even when idle, and the
//! same receive → ingest → flush → ack → cascade → broadcast sequence
//! per client message. Disconnect is an algebraic retraction into
//! `_subscriptions`, re-cascaded if the retraction is non-empty.

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{accept4, bind, listen, socket, AddressFamily, SockFlag, SockType, UnixAddr};

use gnitzdb_core::ZSetBatch;
use gnitzdb_vm::FunctionRegistry;

use crate::cascade::{CascadeExecutor, CascadeOutput};
use crate::catalog::{SystemCatalog, SYS_TABLE_SUBSCRIPTIONS};
use crate::error::{ExecutorError, Result};
use crate::ipc::{self, STATUS_OK};
use crate::program_cache::ProgramCache;

pub struct ServerConfig {
    pub socket_path: PathBuf,
    /// How long one `poll()` call blocks with nothing to do, so a
    /// shutdown flag set from another thread is noticed promptly.
    pub poll_timeout_ms: u16,
}

impl ServerConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        ServerConfig { socket_path: socket_path.into(), poll_timeout_ms: 500 }
    }
}

struct Client {
    fd: OwnedFd,
    client_id: u64,
}

/// Owns the listening socket, every connected client, and the shared
/// catalog/program-cache/cascade machinery they drive.
pub struct ServerExecutor {
    config: ServerConfig,
    catalog: Arc<SystemCatalog>,
    programs: Arc<ProgramCache>,
    cascade: CascadeExecutor,
    listener: OwnedFd,
    clients: HashMap<RawFd, Client>,
    next_client_id: u64,
}

impl ServerExecutor {
    pub fn bind(
        config: ServerConfig,
        catalog: Arc<SystemCatalog>,
        programs: Arc<ProgramCache>,
        functions: Arc<FunctionRegistry>,
    ) -> Result<Self> {
        let _ = std::fs::remove_file(&config.socket_path);
        let addr = UnixAddr::new(config.socket_path.as_path()).map_err(|e| ExecutorError::Transport(e.to_string()))?;
        let listener = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_NONBLOCK,
            None,
        )?;
        bind(listener.as_raw_fd(), &addr)?;
        listen(&listener, 128)?;

        let cascade = CascadeExecutor::new(catalog.clone(), programs.clone(), functions);
        Ok(ServerExecutor {
            config,
            catalog,
            programs,
            cascade,
            listener,
            clients: HashMap::new(),
            next_client_id: 1,
        })
    }

    /// Run the event loop until `shutdown` is set. Every iteration is
    /// one `poll()` plus whatever client messages are ready.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        while !shutdown.load(Ordering::Relaxed) {
            self.tick()?;
        }
        Ok(())
    }

    fn tick(&mut self) -> Result<()> {
        // `fds` borrows `self.listener`/`self.clients`; collect plain,
        // unborrowed revents out of it before touching `self` mutably.
        let client_fds: Vec<RawFd> = self.clients.keys().copied().collect();
        let (listener_revents, client_revents) = {
            let mut fds: Vec<PollFd> = Vec::with_capacity(client_fds.len() + 1);
            fds.push(PollFd::new(self.listener.as_fd(), PollFlags::POLLIN));
            for &fd in &client_fds {
                fds.push(PollFd::new(self.clients[&fd].fd.as_fd(), PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR));
            }
            let timeout = PollTimeout::from(self.config.poll_timeout_ms);
            nix::poll::poll(&mut fds, timeout)?;
            let listener_revents = fds[0].revents().unwrap_or(PollFlags::empty());
            let client_revents: Vec<PollFlags> = fds[1..].iter().map(|p| p.revents().unwrap_or(PollFlags::empty())).collect();
            (listener_revents, client_revents)
        };

        if listener_revents.contains(PollFlags::POLLIN) {
            self.accept_one()?;
        }

        for (fd, revents) in client_fds.into_iter().zip(client_revents) {
            if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                self.cleanup_client(fd)?;
            } else if revents.contains(PollFlags::POLLIN) {
                if let Err(err) = self.handle_client_data(fd) {
                    tracing::warn!(client = fd, error = %err, "client message failed, disconnecting");
                    self.cleanup_client(fd)?;
                }
            }
        }
        Ok(())
    }

    fn accept_one(&mut self) -> Result<()> {
        let raw = accept4(self.listener.as_raw_fd(), SockFlag::SOCK_NONBLOCK)?;
        // Safety: `accept4` just handed us a fresh, uniquely owned fd.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let client_id = self.next_client_id;
        self.next_client_id += 1;
        tracing::debug!(client = raw, client_id, "client connected");
        self.clients.insert(raw, Client { fd, client_id });
        Ok(())
    }

    /// Receive one ingest request, apply it, ACK, then run the
    /// downstream cascade and broadcast every view output it produces.
    fn handle_client_data(&mut self, fd: RawFd) -> Result<()> {
        let sock = self.clients[&fd].fd.as_fd();
        let client_id = self.clients[&fd].client_id;

        let Some(payload_fd) = ipc::recv_fd(sock)? else {
            return Ok(());
        };
        let catalog = &self.catalog;
        let payload = ipc::read_payload(payload_fd, |header| {
            catalog.get(header.target_id).map(|h| h.schema().clone())
        })?;
        let target_id = payload.header.target_id;
        let handle = self.catalog.get_or_err(target_id)?;
        let batch = payload.batch.unwrap_or_else(|| ZSetBatch::new(handle.schema().clone()));
        handle.ingest(&batch)?;

        let ack_fd = ipc::serialize_to_memfd(None, None, STATUS_OK, "", target_id, client_id)?;
        ipc::send_fd(sock, ack_fd.as_fd())?;

        let outputs = self.cascade.evaluate(target_id, batch)?;
        for output in outputs {
            self.broadcast_delta(&output)?;
        }
        Ok(())
    }

    fn broadcast_delta(&mut self, output: &CascadeOutput) -> Result<()> {
        let targets = self.subscribers_of(output.view_id)?;
        if targets.is_empty() {
            return Ok(());
        }
        let schema = self.catalog.get_or_err(output.view_id)?.schema().clone();
        let fd = ipc::serialize_to_memfd(Some(&schema), Some(&output.delta), STATUS_OK, "", output.view_id, 0)?;

        let mut dead = Vec::new();
        for client_fd in targets {
            if let Some(client) = self.clients.get(&client_fd) {
                if ipc::send_fd(client.fd.as_fd(), fd.as_fd()).is_err() {
                    dead.push(client_fd);
                }
            }
        }
        for fd in dead {
            self.cleanup_client(fd)?;
        }
        Ok(())
    }

    fn subscribers_of(&self, view_id: u64) -> Result<Vec<RawFd>> {
        if !self.catalog.has_id(SYS_TABLE_SUBSCRIPTIONS) {
            return Ok(Vec::new());
        }
        let subs = self.catalog.get_or_err(SYS_TABLE_SUBSCRIPTIONS)?;
        let mut cursor = subs.create_cursor()?;
        let mut client_ids = Vec::new();
        while cursor.is_valid() {
            if cursor.weight().unwrap_or(0) > 0 {
                if let Some(row) = cursor.get_accessor() {
                    // 0=sub_id (PK), 1=view_id, 2=client_id.
                    if row.get_int_unsigned(1) == view_id {
                        client_ids.push(row.get_int_unsigned(2));
                    }
                }
            }
            cursor.advance_cursor()?;
        }
        cursor.close()?;

        Ok(self
            .clients
            .iter()
            .filter(|(_, c)| client_ids.contains(&c.client_id))
            .map(|(&fd, _)| fd)
            .collect())
    }

    /// Disconnect: drop the socket, then retract every subscription row
    /// this client owned so `_subscriptions` reflects who's still
    /// listening. A non-empty retraction re-enters the cascade exactly
    /// like any other ingest, since downstream views may key off it.
    fn cleanup_client(&mut self, fd: RawFd) -> Result<()> {
        let Some(client) = self.clients.remove(&fd) else { return Ok(()) };
        tracing::debug!(client = fd, client_id = client.client_id, "client disconnected");
        drop(client.fd);

        if !self.catalog.has_id(SYS_TABLE_SUBSCRIPTIONS) {
            return Ok(());
        }
        let subs = self.catalog.get_or_err(SYS_TABLE_SUBSCRIPTIONS)?;
        let schema = subs.schema().clone();
        let mut retraction = ZSetBatch::new(schema.clone());
        {
            let mut cursor = subs.create_cursor()?;
            while cursor.is_valid() {
                let weight = cursor.weight().unwrap_or(0);
                if weight > 0 {
                    if let (Some(pk), Some(row)) = (cursor.key(), cursor.get_accessor()) {
                        if row.get_int_unsigned(2) == client.client_id {
                            retraction.append(pk.0, pk.1, -weight, row.clone());
                        }
                    }
                }
                cursor.advance_cursor()?;
            }
            cursor.close()?;
        }

        if retraction.is_empty() {
            return Ok(());
        }
        subs.ingest(&retraction)?;
        let outputs = self.cascade.evaluate(SYS_TABLE_SUBSCRIPTIONS, retraction)?;
        for output in outputs {
            self.broadcast_delta(&output)?;
        }
        Ok(())
    }
}
