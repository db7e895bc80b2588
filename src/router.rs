//! Synchronous request/response correlation.
//!
//! Every `send_and_wait` registers a waiter keyed by its conversation guid.
//! The peer's response frame reuses the guid; the receive loop hands it
//! here and the parked caller wakes. A single background ticker sweeps
//! expired waiters; connection teardown drains the waiters it owns.
//!
//! Responses are always consumed from the wire first — the router only
//! decides whether they reach a caller or get dropped. A late response
//! therefore never leaves stray bytes in the stream.

use crate::events::SyncResponse;
use chrono::{DateTime, Utc};
use fw_protocol::{Metadata, Status};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;

const EXPIRY_SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// A response frame as pulled off the wire.
#[derive(Debug)]
pub(crate) struct SyncResponseFrame {
    pub status: Status,
    pub metadata: Option<Metadata>,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub(crate) enum SyncOutcome {
    Response(SyncResponseFrame),
    Timeout,
    PeerDisconnected,
    Cancelled,
}

struct Waiter {
    tx: oneshot::Sender<SyncOutcome>,
    deadline: DateTime<Utc>,
    owner: Uuid,
}

#[derive(Default)]
pub(crate) struct ResponseRouter {
    waiters: Mutex<HashMap<Uuid, Waiter>>,
}

impl ResponseRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(ResponseRouter::default())
    }

    /// Park a waiter for `conv_guid`, owned by connection `owner`.
    pub fn register(
        &self,
        conv_guid: Uuid,
        deadline: DateTime<Utc>,
        owner: Uuid,
    ) -> oneshot::Receiver<SyncOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().expect("router lock");
        waiters.insert(
            conv_guid,
            Waiter {
                tx,
                deadline,
                owner,
            },
        );
        rx
    }

    pub fn unregister(&self, conv_guid: &Uuid) {
        let mut waiters = self.waiters.lock().expect("router lock");
        waiters.remove(conv_guid);
    }

    /// Hand a response to its waiter. Returns false when nobody is waiting
    /// (expired or never registered); the frame is dropped in that case.
    pub fn deliver(&self, conv_guid: Uuid, frame: SyncResponseFrame) -> bool {
        let waiter = {
            let mut waiters = self.waiters.lock().expect("router lock");
            waiters.remove(&conv_guid)
        };
        match waiter {
            Some(w) => {
                // Signal after the lock is released; the caller may run
                // arbitrary code as soon as it wakes.
                let _ = w.tx.send(SyncOutcome::Response(frame));
                true
            }
            None => {
                debug!(conv_guid = %conv_guid, "late or unknown sync response dropped");
                false
            }
        }
    }

    /// Remove and time out every waiter past its deadline. Returns how
    /// many were expired.
    pub fn expire(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<Waiter> = {
            let mut waiters = self.waiters.lock().expect("router lock");
            let guids: Vec<Uuid> = waiters
                .iter()
                .filter(|(_, w)| w.deadline < now)
                .map(|(g, _)| *g)
                .collect();
            guids
                .into_iter()
                .filter_map(|g| waiters.remove(&g))
                .collect()
        };
        let count = expired.len();
        for w in expired {
            let _ = w.tx.send(SyncOutcome::Timeout);
        }
        count
    }

    /// Resolve every waiter owned by a torn-down connection.
    pub fn drain_for_connection(&self, owner: Uuid) {
        let drained: Vec<Waiter> = {
            let mut waiters = self.waiters.lock().expect("router lock");
            let guids: Vec<Uuid> = waiters
                .iter()
                .filter(|(_, w)| w.owner == owner)
                .map(|(g, _)| *g)
                .collect();
            guids
                .into_iter()
                .filter_map(|g| waiters.remove(&g))
                .collect()
        };
        if !drained.is_empty() {
            warn!(owner = %owner, count = drained.len(), "resolving pending sync requests as disconnected");
        }
        for w in drained {
            let _ = w.tx.send(SyncOutcome::PeerDisconnected);
        }
    }

    /// Resolve everything as cancelled; endpoint shutdown path.
    pub fn drain_all(&self) {
        let drained: Vec<Waiter> = {
            let mut waiters = self.waiters.lock().expect("router lock");
            waiters.drain().map(|(_, w)| w).collect()
        };
        for w in drained {
            let _ = w.tx.send(SyncOutcome::Cancelled);
        }
    }

    pub fn pending(&self) -> usize {
        self.waiters.lock().expect("router lock").len()
    }

    /// Single ≤1 Hz sweeper for the whole endpoint.
    pub fn spawn_expiry_sweeper(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EXPIRY_SWEEP_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        router.expire(Utc::now());
                    }
                }
            }
        })
    }
}

impl From<SyncResponseFrame> for SyncResponse {
    fn from(frame: SyncResponseFrame) -> Self {
        SyncResponse {
            metadata: frame.metadata,
            data: frame.data,
        }
    }
}
