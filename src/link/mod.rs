//! Retried calls to the coordinator and to peers.
//!
//! Two tools:
//!
//! - [`retry`]: run a one-shot operation up to `max_attempts` times with a
//!   fixed pause, inside an overall deadline.
//! - [`Link`]: a long-lived connection owned by a supervisor thread. A failed
//!   call moves the link to [`LinkState::Reconnecting`] by sending the
//!   supervisor a message; callers wait on the state change instead of
//!   sleeping. When reconnecting runs out of attempts the link is
//!   [`LinkState::Failed`] until the next caller asks for another round.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use tracing::{error, info, warn};

use crate::art::DocId;
use crate::cluster::{Coordinator, ShardAddress, ShardId};
use crate::error::LinkError;

/// Bounds for a retried call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before giving up (at least 1).
    pub max_attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
    /// Deadline for the whole call, pauses included.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(1000),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// The fixed delay plus up to 10% jitter so retrying shards spread out.
    pub fn pause(&self) -> Duration {
        let spread = (self.delay.as_millis() as u64) / 10;
        let jitter = if spread == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=spread)
        };
        self.delay + Duration::from_millis(jitter)
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy runs out.
///
/// Only [`LinkError::Transient`] failures are retried.
pub fn retry<T>(
    policy: &RetryPolicy,
    what: &str,
    mut op: impl FnMut() -> Result<T, LinkError>,
) -> Result<T, LinkError> {
    let deadline = Instant::now() + policy.timeout;
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => e,
            Err(e) => return Err(e),
        };
        warn!(what, attempt, max_attempts, error = %err, "attempt failed");
        if attempt >= max_attempts {
            return Err(LinkError::Exhausted {
                attempts: attempt,
                last: err.to_string(),
            });
        }
        let pause = policy.pause();
        if Instant::now() + pause > deadline {
            return Err(LinkError::Timeout(policy.timeout));
        }
        thread::sleep(pause);
    }
}

/// Establishes a fresh client for a [`Link`].
pub trait Connect: Send + Sync + 'static {
    /// The connected handle.
    type Client: Send + Sync + 'static;

    /// Open a new connection.
    fn connect(&self) -> Result<Self::Client, LinkError>;
}

/// Observable state of a [`Link`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// A client is available.
    Connected,
    /// The supervisor is trying to connect.
    Reconnecting,
    /// The last reconnect round used up its attempts.
    Failed,
}

enum Slot<T> {
    Connected { client: Arc<T>, generation: u64 },
    Reconnecting,
    Failed,
}

enum Command {
    Reconnect,
    Shutdown,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    changed: Condvar,
}

/// A supervised connection with retrying calls.
pub struct Link<C: Connect> {
    shared: Arc<Shared<C::Client>>,
    commands: Sender<Command>,
    policy: RetryPolicy,
    supervisor: Option<JoinHandle<()>>,
}

impl<C: Connect> Link<C> {
    /// Start the supervisor and begin connecting in the background.
    pub fn open(connector: C, policy: RetryPolicy) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::Reconnecting),
            changed: Condvar::new(),
        });
        let (commands, inbox) = unbounded();
        // The receiver is alive, so this cannot fail.
        let _ = commands.send(Command::Reconnect);

        let supervisor = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("link-supervisor".into())
                .spawn(move || supervise(connector, shared, inbox, policy))?
        };

        Ok(Self {
            shared,
            commands,
            policy,
            supervisor: Some(supervisor),
        })
    }

    /// Current state.
    pub fn state(&self) -> LinkState {
        match &*self.shared.slot.lock() {
            Slot::Connected { .. } => LinkState::Connected,
            Slot::Reconnecting => LinkState::Reconnecting,
            Slot::Failed => LinkState::Failed,
        }
    }

    /// Block until the link leaves [`LinkState::Reconnecting`] or `timeout` passes.
    pub fn wait_settled(&self, timeout: Duration) -> LinkState {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        while matches!(*slot, Slot::Reconnecting) {
            if self.shared.changed.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        drop(slot);
        self.state()
    }

    /// Run `op` against the connected client.
    ///
    /// A transient failure triggers a reconnect and the call is retried on
    /// the new client, up to the policy's attempts and deadline.
    pub fn call<T>(&self, mut op: impl FnMut(&C::Client) -> Result<T, LinkError>) -> Result<T, LinkError> {
        let deadline = Instant::now() + self.policy.timeout;
        let max_attempts = self.policy.max_attempts.max(1);
        let mut revived = false;
        let mut attempt = 0;
        loop {
            let (client, generation) = self.wait_connected(deadline, &mut revived)?;
            attempt += 1;
            let err = match op(&client) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };
            warn!(attempt, max_attempts, error = %err, "link call failed");
            self.request_reconnect(generation);
            if attempt >= max_attempts {
                return Err(LinkError::Exhausted {
                    attempts: attempt,
                    last: err.to_string(),
                });
            }
        }
    }

    fn wait_connected(
        &self,
        deadline: Instant,
        revived: &mut bool,
    ) -> Result<(Arc<C::Client>, u64), LinkError> {
        let mut slot = self.shared.slot.lock();
        loop {
            match &*slot {
                Slot::Connected { client, generation } => return Ok((Arc::clone(client), *generation)),
                Slot::Failed if !*revived => {
                    *revived = true;
                    *slot = Slot::Reconnecting;
                    self.send(Command::Reconnect);
                }
                Slot::Failed => return Err(LinkError::Unavailable),
                Slot::Reconnecting => {
                    if self.shared.changed.wait_until(&mut slot, deadline).timed_out() {
                        return Err(LinkError::Timeout(self.policy.timeout));
                    }
                }
            }
        }
    }

    /// Drop the client of `generation` and ask for a new one, unless someone already did.
    fn request_reconnect(&self, generation: u64) {
        let mut slot = self.shared.slot.lock();
        if let Slot::Connected { generation: current, .. } = &*slot {
            if *current == generation {
                info!(generation, "link reconnecting");
                *slot = Slot::Reconnecting;
                self.send(Command::Reconnect);
            }
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            error!("link supervisor is gone");
        }
    }
}

fn supervise<C: Connect>(
    connector: C,
    shared: Arc<Shared<C::Client>>,
    inbox: Receiver<Command>,
    policy: RetryPolicy,
) {
    let max_attempts = policy.max_attempts.max(1);
    let mut generation = 0u64;
    while let Ok(Command::Reconnect) = inbox.recv() {
        let mut attempt = 0;
        let connected = loop {
            attempt += 1;
            match connector.connect() {
                Ok(client) => break Some(client),
                Err(e) => {
                    warn!(attempt, max_attempts, error = %e, "connect failed");
                    if attempt >= max_attempts {
                        break None;
                    }
                    match inbox.recv_timeout(policy.pause()) {
                        Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
                        Ok(Command::Reconnect) | Err(RecvTimeoutError::Timeout) => {}
                    }
                }
            }
        };

        let mut slot = shared.slot.lock();
        *slot = match connected {
            Some(client) => {
                generation += 1;
                info!(generation, "link connected");
                Slot::Connected {
                    client: Arc::new(client),
                    generation,
                }
            }
            None => {
                error!(attempts = attempt, "link failed");
                Slot::Failed
            }
        };
        shared.changed.notify_all();
    }
}

impl<C: Connect> Drop for Link<C> {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.supervisor.take() {
            if handle.join().is_err() {
                warn!("link supervisor panicked");
            }
        }
    }
}

impl<C> Coordinator for Link<C>
where
    C: Connect,
    C::Client: Coordinator,
{
    fn allocate_next_document_id(&self) -> Result<DocId, LinkError> {
        self.call(|client| client.allocate_next_document_id())
    }

    fn most_available_peer(&self, excluding: &ShardId) -> Result<Option<ShardAddress>, LinkError> {
        self.call(|client| client.most_available_peer(excluding))
    }
}
