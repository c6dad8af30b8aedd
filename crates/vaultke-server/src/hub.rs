//! Relay hub: the process-wide fan-out fabric.
//!
//! A single director task owns the connection, user and room maps. Nothing
//! else touches them; readers and writers talk to the director through
//! three queues (register, unregister, broadcast), and the director talks
//! to writers through each connection's bounded send channel. The director
//! never waits on a connection: a send channel that is full gets the
//! connection evicted instead.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vaultke_shared::ServerFrame;

/// Process-unique connection identifier.
pub type ConnId = u64;

const DIRECTOR_QUEUE_DEPTH: usize = 1024;

enum RegisterCmd {
    Connection {
        id: ConnId,
        user_id: String,
        sender: mpsc::Sender<ServerFrame>,
    },
    /// Subscribe an existing connection to a room.
    Room { id: ConnId, room_id: String },
}

enum UnregisterCmd {
    Connection { id: ConnId },
    Room { id: ConnId, room_id: String },
}

struct BroadcastCmd {
    room_id: String,
    frame: ServerFrame,
}

/// Cloneable handle to the director task.
#[derive(Clone)]
pub struct Hub {
    register_tx: mpsc::Sender<RegisterCmd>,
    unregister_tx: mpsc::Sender<UnregisterCmd>,
    broadcast_tx: mpsc::Sender<BroadcastCmd>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    next_id: Arc<AtomicU64>,
}

impl Hub {
    /// Start the director task and return a handle to it.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (register_tx, register_rx) = mpsc::channel(DIRECTOR_QUEUE_DEPTH);
        let (unregister_tx, unregister_rx) = mpsc::channel(DIRECTOR_QUEUE_DEPTH);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(DIRECTOR_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(direct(register_rx, unregister_rx, broadcast_rx, shutdown_rx));

        let hub = Self {
            register_tx,
            unregister_tx,
            broadcast_tx,
            shutdown_tx: Arc::new(shutdown_tx),
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (hub, handle)
    }

    /// Attach a connection. The sender is the connection's bounded send
    /// channel; the hub closes it on eviction and on shutdown.
    pub async fn register(&self, user_id: &str, sender: mpsc::Sender<ServerFrame>) -> ConnId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .register_tx
            .send(RegisterCmd::Connection {
                id,
                user_id: user_id.to_string(),
                sender,
            })
            .await;
        id
    }

    pub async fn unregister(&self, id: ConnId) {
        let _ = self
            .unregister_tx
            .send(UnregisterCmd::Connection { id })
            .await;
    }

    pub async fn join_room(&self, id: ConnId, room_id: &str) {
        let _ = self
            .register_tx
            .send(RegisterCmd::Room {
                id,
                room_id: room_id.to_string(),
            })
            .await;
    }

    pub async fn leave_room(&self, id: ConnId, room_id: &str) {
        let _ = self
            .unregister_tx
            .send(UnregisterCmd::Room {
                id,
                room_id: room_id.to_string(),
            })
            .await;
    }

    /// Fan a frame out to every connection subscribed to the room,
    /// including the sender's own.
    pub async fn broadcast(&self, room_id: &str, frame: ServerFrame) {
        let _ = self
            .broadcast_tx
            .send(BroadcastCmd {
                room_id: room_id.to_string(),
                frame,
            })
            .await;
    }

    /// Ask the director to close every send channel and exit.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

struct Client {
    user_id: String,
    sender: mpsc::Sender<ServerFrame>,
    rooms: HashSet<String>,
}

#[derive(Default)]
struct HubState {
    clients: HashMap<ConnId, Client>,
    users: HashMap<String, HashSet<ConnId>>,
    rooms: HashMap<String, HashSet<ConnId>>,
}

impl HubState {
    fn apply_register(&mut self, cmd: RegisterCmd) {
        match cmd {
            RegisterCmd::Connection { id, user_id, sender } => {
                self.users.entry(user_id.clone()).or_default().insert(id);
                self.clients.insert(
                    id,
                    Client {
                        user_id,
                        sender,
                        rooms: HashSet::new(),
                    },
                );
                debug!(
                    conn = id,
                    connections = self.clients.len(),
                    users = self.users.len(),
                    "Connection registered"
                );
            }
            RegisterCmd::Room { id, room_id } => {
                // A join racing a disconnect is dropped silently.
                let Some(client) = self.clients.get_mut(&id) else {
                    return;
                };
                client.rooms.insert(room_id.clone());
                self.rooms.entry(room_id).or_default().insert(id);
            }
        }
    }

    fn apply_unregister(&mut self, cmd: UnregisterCmd) {
        match cmd {
            UnregisterCmd::Connection { id } => self.evict(id),
            UnregisterCmd::Room { id, room_id } => {
                if let Some(client) = self.clients.get_mut(&id) {
                    client.rooms.remove(&room_id);
                }
                if let Some(subscribers) = self.rooms.get_mut(&room_id) {
                    subscribers.remove(&id);
                    if subscribers.is_empty() {
                        self.rooms.remove(&room_id);
                    }
                }
            }
        }
    }

    fn fan_out(&mut self, cmd: BroadcastCmd) {
        let Some(subscribers) = self.rooms.get(&cmd.room_id) else {
            return;
        };

        let mut evicted = Vec::new();
        for &id in subscribers {
            let Some(client) = self.clients.get(&id) else {
                continue;
            };
            match client.sender.try_send(cmd.frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(conn = id, user = %client.user_id, "Send queue full, evicting");
                    evicted.push(id);
                }
                Err(TrySendError::Closed(_)) => evicted.push(id),
            }
        }

        for id in evicted {
            self.evict(id);
        }
    }

    /// Remove a connection from every map. Dropping its sender closes the
    /// send channel, which makes its writer and reader exit.
    fn evict(&mut self, id: ConnId) {
        let Some(client) = self.clients.remove(&id) else {
            return;
        };
        if let Some(conns) = self.users.get_mut(&client.user_id) {
            conns.remove(&id);
            if conns.is_empty() {
                self.users.remove(&client.user_id);
            }
        }
        for room_id in &client.rooms {
            if let Some(subscribers) = self.rooms.get_mut(room_id) {
                subscribers.remove(&id);
                if subscribers.is_empty() {
                    self.rooms.remove(room_id);
                }
            }
        }
        debug!(conn = id, connections = self.clients.len(), "Connection removed");
    }
}

async fn direct(
    mut register_rx: mpsc::Receiver<RegisterCmd>,
    mut unregister_rx: mpsc::Receiver<UnregisterCmd>,
    mut broadcast_rx: mpsc::Receiver<BroadcastCmd>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut state = HubState::default();

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            cmd = register_rx.recv() => match cmd {
                Some(cmd) => state.apply_register(cmd),
                None => break,
            },
            cmd = unregister_rx.recv() => match cmd {
                Some(cmd) => state.apply_unregister(cmd),
                None => break,
            },
            cmd = broadcast_rx.recv() => match cmd {
                Some(cmd) => state.fan_out(cmd),
                None => break,
            },
        }
    }

    // Graceful shutdown: dropping every sender closes the send channels,
    // which terminates each connection's writer and reader.
    let connections = state.clients.len();
    state.clients.clear();
    state.users.clear();
    state.rooms.clear();
    info!(connections, "Hub stopped");
}
