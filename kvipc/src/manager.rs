//! The manager process: launches workers on demand, terminates them, and
//! reaps the ones that die.
//!
//! The manager serves its own channel (id 0) with the same protocol the
//! workers use; only `Launch` and `Terminate` are meaningful on it. The
//! worker-ready handshake does not go through the request loop: the
//! manager creates the worker's channel before spawning the process and
//! then waits on the channel's `started` semaphore, which the worker
//! posts right before it begins serving.

use std::collections::HashMap;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::errors::{IpcError, Result};
use crate::message::{Header, Op, Status};

/// Channel id reserved for the manager itself.
pub const MANAGER_CHANNEL_ID: u32 = 0;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Worker binary to spawn on `Launch`.
    pub worker_exe: String,
    /// How often the idle manager probes worker liveness.
    pub probe_interval_ms: u64,
    /// How long a freshly spawned worker gets to signal ready.
    pub launch_timeout_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            worker_exe: String::from("kvworker"),
            probe_interval_ms: 1_000,
            launch_timeout_ms: 10_000,
        }
    }
}

struct WorkerHandle {
    worker_id: u32,
    db_id: u32,
    child: Child,
    /// The manager's own mapping of the worker channel it created.
    channel: Channel,
}

pub struct Manager {
    config: ManagerConfig,
    channel: Channel,
    workers: HashMap<u32, WorkerHandle>,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Result<Manager> {
        Ok(Manager {
            config,
            channel: Channel::create(MANAGER_CHANNEL_ID)?,
            workers: HashMap::new(),
        })
    }

    /// Serve control requests until `shutdown` is set. Registered workers
    /// are terminated on the way out.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        log::info!("manager serving on {}", self.channel.name());
        let probe = Duration::from_millis(self.config.probe_interval_ms);

        loop {
            if shutdown.load(Ordering::Relaxed) {
                log::info!("manager interrupted, shutting down");
                break;
            }
            match self.channel.recv_request_timeout(probe) {
                Ok(None) => self.reap(),
                Ok(Some((hdr, _body))) => self.dispatch(&hdr)?,
                Err(IpcError::Interrupted) => continue,
                Err(IpcError::Protocol(msg)) => {
                    log::warn!("manager dropped a malformed request: {}", msg);
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        self.teardown();
        Ok(())
    }

    fn dispatch(&mut self, hdr: &Header) -> Result<()> {
        match hdr.op {
            Op::Launch => self.handle_launch(hdr),
            Op::Terminate => self.handle_terminate(hdr),
            other => {
                log::warn!("manager ignoring operation {:?}", other);
                Ok(())
            }
        }
    }

    fn respond(&self, rps_id: u32, status: Status) -> Result<()> {
        let mut hdr = Header::response(status, rps_id);
        self.channel.send_response(rps_id, &mut hdr, &())
    }

    fn handle_launch(&mut self, hdr: &Header) -> Result<()> {
        let worker_id = hdr.rel_id;
        if worker_id == MANAGER_CHANNEL_ID {
            log::warn!("refusing to launch a worker with the manager's channel id");
            return self.respond(hdr.rps_id, Status::Failure);
        }

        if let Some(handle) = self.workers.get_mut(&worker_id) {
            match handle.child.try_wait() {
                Ok(None) => {
                    // Already running; launching is idempotent.
                    return self.respond(hdr.rps_id, Status::Success);
                }
                _ => {
                    log::warn!("worker {} died, relaunching", worker_id);
                    if let Some(handle) = self.workers.remove(&worker_id) {
                        let _ = handle.channel.unlink();
                    }
                }
            }
        }

        match self.spawn_worker(worker_id, hdr.db_id) {
            Ok(handle) => {
                log::info!("worker {} launched for database {}", worker_id, hdr.db_id);
                self.workers.insert(worker_id, handle);
                self.respond(hdr.rps_id, Status::Success)
            }
            Err(err) => {
                log::warn!("failed to launch worker {}: {}", worker_id, err);
                self.respond(hdr.rps_id, Status::Failure)
            }
        }
    }

    fn spawn_worker(&self, worker_id: u32, db_id: u32) -> Result<WorkerHandle> {
        // The channel exists before the process does, so the worker only
        // ever opens it.
        let channel = Channel::create(worker_id)?;
        let child = Command::new(&self.config.worker_exe)
            .arg("--worker-id")
            .arg(worker_id.to_string())
            .arg("--db-id")
            .arg(db_id.to_string())
            .spawn()
            .map_err(|source| IpcError::System {
                call: "spawn",
                source,
            });
        let mut child = match child {
            Ok(child) => child,
            Err(err) => {
                let _ = channel.unlink();
                return Err(err);
            }
        };

        let timeout = Duration::from_millis(self.config.launch_timeout_ms);
        match channel.wait_started(timeout) {
            Ok(true) => Ok(WorkerHandle {
                worker_id,
                db_id,
                child,
                channel,
            }),
            ready => {
                if let Err(err) = &ready {
                    log::warn!("waiting for worker {}: {}", worker_id, err);
                } else {
                    log::warn!("worker {} did not signal ready in time", worker_id);
                }
                let _ = child.kill();
                let _ = child.wait();
                let _ = channel.unlink();
                Err(IpcError::ChannelClosed)
            }
        }
    }

    fn handle_terminate(&mut self, hdr: &Header) -> Result<()> {
        let worker_id = hdr.rel_id;
        match self.workers.remove(&worker_id) {
            // Terminating an unknown worker is fine; it may already be
            // reaped.
            None => self.respond(hdr.rps_id, Status::Success),
            Some(mut handle) => {
                let stopped = self.stop_worker(&mut handle);
                self.respond(
                    hdr.rps_id,
                    if stopped {
                        Status::Success
                    } else {
                        Status::Failure
                    },
                )
            }
        }
    }

    /// Forward `Terminate` on the worker's own channel and wait for the
    /// process to exit. Falls back to killing it when the channel is
    /// broken.
    fn stop_worker(&self, handle: &mut WorkerHandle) -> bool {
        let mut hdr = Header::request(Op::Terminate, handle.worker_id, handle.db_id);
        match handle.channel.send(&mut hdr, &()) {
            Ok(()) => match handle.child.wait() {
                Ok(status) => {
                    log::info!("worker {} exited: {}", handle.worker_id, status);
                    true
                }
                Err(err) => {
                    log::warn!("waiting for worker {}: {}", handle.worker_id, err);
                    false
                }
            },
            Err(err) => {
                log::warn!(
                    "terminate via channel failed for worker {}: {}",
                    handle.worker_id,
                    err
                );
                let _ = handle.child.kill();
                let _ = handle.child.wait();
                let _ = handle.channel.unlink();
                false
            }
        }
    }

    /// Drop registry entries whose process has died. A worker that
    /// crashed never destroyed its channel, so the name is unlinked here.
    fn reap(&mut self) {
        self.workers.retain(|worker_id, handle| match handle.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                log::warn!("reaping worker {}: exited {}", worker_id, status);
                let _ = handle.channel.unlink();
                false
            }
            Err(err) => {
                log::warn!("probing worker {}: {}", worker_id, err);
                true
            }
        });
    }

    fn teardown(&mut self) {
        let worker_ids: Vec<u32> = self.workers.keys().copied().collect();
        for worker_id in worker_ids {
            if let Some(mut handle) = self.workers.remove(&worker_id) {
                self.stop_worker(&mut handle);
            }
        }
        self.channel.destroy();
    }
}

/// Backend-side stub for the manager.
pub struct ManagerClient {
    channel: Channel,
}

impl ManagerClient {
    pub fn connect() -> Result<ManagerClient> {
        Ok(ManagerClient {
            channel: Channel::open(MANAGER_CHANNEL_ID)?,
        })
    }

    fn request(&self, op: Op, worker_id: u32, db_id: u32) -> Result<bool> {
        let mut hdr = Header::request(op, worker_id, db_id);
        let slot = self.channel.send_request(&mut hdr, &())?;
        let response = self.channel.recv(slot);
        self.channel.release_slot(slot)?;
        Ok(response?.0.status == Status::Success)
    }

    /// Ask the manager to start the worker for `(worker_id, db_id)`.
    /// `true` once the worker is up, including when it already was.
    pub fn launch(&self, worker_id: u32, db_id: u32) -> Result<bool> {
        self.request(Op::Launch, worker_id, db_id)
    }

    /// Ask the manager to stop a worker. `true` when the worker is gone,
    /// including when it never existed.
    pub fn terminate(&self, worker_id: u32, db_id: u32) -> Result<bool> {
        self.request(Op::Terminate, worker_id, db_id)
    }
}
