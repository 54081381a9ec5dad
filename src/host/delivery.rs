//! Update delivery engine.
//!
//! Decides when the current payload is (re)sent to the guest. Every
//! trigger sends immediately and restarts the fixed retry ladder; an
//! `ack` cancels what is left of it. Only the latest payload is ever
//! in flight.
use std::time::Instant;

use tracing::debug;

use super::scheduler::{Scheduler, TimerId};
use super::session::SandboxSession;
use crate::backoff::RetryLadder;
use crate::protocol::{Envelope, Message};

/// What caused a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    PayloadChanged,
    GuestReady,
    UpdateRequested,
}

/// Timer events owned by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostTimer {
    Retry { rung: usize },
}

/// Result of a fired retry.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStep {
    /// Nothing to send (acked, detached, or no payload).
    Skip,
    /// Send this envelope; `last` marks the final rung of the ladder.
    Resend { envelope: Envelope, last: bool },
}

#[derive(Debug)]
pub struct UpdateDelivery {
    ladder: RetryLadder,
    retries: Vec<TimerId>,
}

impl UpdateDelivery {
    pub fn new(ladder: RetryLadder) -> Self {
        Self {
            ladder,
            retries: Vec::new(),
        }
    }

    pub fn ladder(&self) -> &RetryLadder {
        &self.ladder
    }

    /// Retries still scheduled for the current payload.
    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    fn update_envelope(session: &SandboxSession) -> Option<Envelope> {
        let payload = session.last_payload()?.clone();
        Some(Envelope::new(
            session.token().as_str(),
            Message::Update(payload),
        ))
    }

    /// Handles a trigger. Returns the envelope to post right away, if any.
    ///
    /// While no frame is attached nothing is sent and no retries are
    /// scheduled; the payload stays buffered until the next `ready`.
    pub fn trigger(
        &mut self,
        trigger: Trigger,
        session: &mut SandboxSession,
        attached: bool,
        scheduler: &mut Scheduler<HostTimer>,
        now: Instant,
    ) -> Option<Envelope> {
        self.cancel(scheduler);

        if trigger == Trigger::GuestReady {
            session.ready = true;
        }
        if trigger != Trigger::PayloadChanged {
            // A guest asking again has not rendered the current payload
            session.acked = false;
        }

        if !attached {
            debug!("Delivery ({trigger:?}) held: no frame attached");
            return None;
        }

        let envelope = Self::update_envelope(session)?;
        for (rung, offset) in self.ladder.rungs().iter().enumerate() {
            let id = scheduler.schedule(session.generation(), now + *offset, HostTimer::Retry { rung });
            self.retries.push(id);
        }
        debug!(
            "Delivery ({trigger:?}) sent, {} retries scheduled",
            self.retries.len()
        );
        Some(envelope)
    }

    /// Handles a fired retry timer.
    pub fn on_retry(
        &mut self,
        id: TimerId,
        rung: usize,
        session: &SandboxSession,
        attached: bool,
    ) -> RetryStep {
        self.retries.retain(|r| *r != id);

        if session.acked || !attached {
            return RetryStep::Skip;
        }
        match Self::update_envelope(session) {
            Some(envelope) => RetryStep::Resend {
                envelope,
                last: rung + 1 >= self.ladder.len(),
            },
            None => RetryStep::Skip,
        }
    }

    /// Records an `ack`; cancels every pending retry. Returns how many
    /// were cancelled.
    pub fn on_ack(
        &mut self,
        session: &mut SandboxSession,
        scheduler: &mut Scheduler<HostTimer>,
    ) -> usize {
        session.acked = true;
        self.cancel(scheduler)
    }

    /// Cancels pending retries without touching session flags.
    pub fn cancel(&mut self, scheduler: &mut Scheduler<HostTimer>) -> usize {
        self.retries
            .drain(..)
            .filter(|id| scheduler.cancel(*id))
            .count()
    }
}
