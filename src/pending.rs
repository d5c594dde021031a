//! Table of in-flight requests awaiting a reply.
//!
//! Maps each live [`CorrelationId`] to the oneshot sender that wakes its
//! caller. An entry leaves the table exactly once: by reply, timeout sweep,
//! drain on disconnect/stop, or cancellation. Whoever removes it owns the
//! sender, so a request can never be completed twice.
//!
//! The table itself is not synchronized; the client keeps it behind its
//! single dispatch mutex.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{ErrorKind, QueryError, Result};
use crate::protocol::{Command, CorrelationId};

/// How a request ended: the reply payload, or why there is none.
pub type Completion = std::result::Result<Bytes, ErrorKind>;

struct PendingEntry {
    serial: u64,
    command: Command,
    issued_at: Instant,
    deadline: Option<Instant>,
    sender: oneshot::Sender<Completion>,
}

/// A request removed from the table, ready to be completed.
///
/// Sweep and drain hand these back so callers can be woken after the lock
/// is released.
pub struct Completer {
    id: CorrelationId,
    command: Command,
    issued_at: Instant,
    sender: oneshot::Sender<Completion>,
}

impl Completer {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    /// Deliver the result. Returns false if the caller already went away.
    pub fn complete(self, completion: Completion) -> bool {
        self.sender.send(completion).is_ok()
    }
}

#[derive(Default)]
pub struct PendingTable {
    entries: HashMap<CorrelationId, PendingEntry>,
    next_serial: u64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new entry.
    ///
    /// Returns a serial that identifies this particular registration (ids
    /// are reused after wrap-around, serials are not) and the receiver the
    /// caller waits on.
    pub fn register(
        &mut self,
        id: CorrelationId,
        command: Command,
        issued_at: Instant,
        deadline: Option<Instant>,
    ) -> Result<(u64, oneshot::Receiver<Completion>)> {
        if self.entries.contains_key(&id) {
            tracing::error!("Correlation id {} registered twice for {}", id, command);
            return Err(QueryError::DuplicateId(id));
        }

        let serial = self.next_serial;
        self.next_serial += 1;

        let (sender, receiver) = oneshot::channel();
        self.entries.insert(
            id,
            PendingEntry {
                serial,
                command,
                issued_at,
                deadline,
                sender,
            },
        );
        Ok((serial, receiver))
    }

    /// Remove the entry for `id` and complete it.
    pub fn resolve(&mut self, id: CorrelationId, completion: Completion) -> Result<()> {
        let entry = self.entries.remove(&id).ok_or(QueryError::NotFound(id))?;
        let _ = entry.sender.send(completion);
        Ok(())
    }

    /// Remove every entry whose deadline is at or before `now`.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<Completer> {
        let expired: Vec<CorrelationId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.take(id))
            .collect()
    }

    /// Remove every entry.
    pub fn drain_all(&mut self) -> Vec<Completer> {
        self.entries
            .drain()
            .map(|(id, entry)| Completer {
                id,
                command: entry.command,
                issued_at: entry.issued_at,
                sender: entry.sender,
            })
            .collect()
    }

    /// Remove the entry for `id` only if it is still the registration
    /// identified by `serial`.
    pub fn cancel(&mut self, id: CorrelationId, serial: u64) -> Option<Completer> {
        match self.entries.get(&id) {
            Some(entry) if entry.serial == serial => self.take(id),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.entries.contains_key(&id)
    }

    fn take(&mut self, id: CorrelationId) -> Option<Completer> {
        self.entries.remove(&id).map(|entry| Completer {
            id,
            command: entry.command,
            issued_at: entry.issued_at,
            sender: entry.sender,
        })
    }
}

/// Hands out correlation ids.
///
/// A wrapping `u32` counter that skips the reserved id 0 and any id still
/// live in the table.
#[derive(Debug)]
pub struct IdAllocator {
    next: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub(crate) fn starting_at(next: u32) -> Self {
        Self { next }
    }

    pub fn next(&mut self, table: &PendingTable) -> CorrelationId {
        loop {
            let candidate = CorrelationId(self.next);
            self.next = self.next.wrapping_add(1);
            if candidate.get() != 0 && !table.contains(candidate) {
                return candidate;
            }
        }
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
