//! Host controller for one widget slot.
//!
//! Ties the session manager, delivery engine and scheduler to a guest
//! frame. Inbound envelopes are authenticated against the current
//! session token and either acted upon or dropped; nothing a guest
//! sends can make the host fail.
use std::collections::VecDeque;
use std::time::Instant;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::delivery::{HostTimer, RetryStep, Trigger, UpdateDelivery};
use super::frame::GuestFrame;
use super::scheduler::Scheduler;
use super::session::{SandboxSession, SessionManager, SessionToken};
use crate::config::Config;
use crate::protocol::{
    CaptureOutcome, CaptureRequest, CaptureResult, Envelope, EnvelopeError, LogLevel, Message,
};
use crate::sandbox::{
    self, BuildError, DocumentOptions, SandboxDocument, TemplateError, WidgetDataContext,
    WidgetTemplate,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum HostError {
    #[error("invalid template: {0}")]
    Template(#[from] TemplateError),
    #[error("cannot build sandbox document: {0}")]
    Build(#[from] BuildError),
    #[error("no sandbox session is open")]
    NoSession,
    #[error("no guest frame attached")]
    Detached,
}

/// Things the embedding UI should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum HostNotice {
    /// Guest acknowledged the current payload.
    Acked,
    /// Guest content height changed (intrinsic-height templates only).
    Resized { height: u32 },
    /// Guest fault, to be shown inline in place of the widget.
    GuestError { message: String },
    /// Answer to a capture request issued by this host.
    Captured(CaptureResult),
}

pub struct WidgetHost {
    widget_id: String,
    config: Config,
    sessions: SessionManager,
    delivery: UpdateDelivery,
    scheduler: Scheduler<HostTimer>,
    frame: Option<Box<dyn GuestFrame>>,
    /// Outstanding capture ids, oldest first.
    pending_captures: VecDeque<String>,
}

/// Capture requests the guest has not answered yet; older ids are
/// forgotten and their late results dropped.
const MAX_PENDING_CAPTURES: usize = 8;

impl WidgetHost {
    pub fn new(widget_id: impl Into<String>, config: Config) -> Self {
        let delivery = UpdateDelivery::new(config.delivery.ladder());
        Self {
            widget_id: widget_id.into(),
            config,
            sessions: SessionManager::new(),
            delivery,
            scheduler: Scheduler::new(),
            frame: None,
            pending_captures: VecDeque::new(),
        }
    }

    pub fn widget_id(&self) -> &str {
        &self.widget_id
    }

    pub fn session(&self) -> Option<&SandboxSession> {
        self.sessions.current()
    }

    pub fn token(&self) -> Option<&SessionToken> {
        self.sessions.current_token()
    }

    pub fn is_attached(&self) -> bool {
        self.frame.is_some()
    }

    /// Retry timers currently pending.
    pub fn pending_timers(&self) -> usize {
        self.scheduler.pending()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    // ── Session lifecycle ───────────────────────────────────

    /// Validates `template`, replaces the current session with a new one
    /// and returns the document the frame must load.
    ///
    /// Any previous frame is detached: it belongs to the old session and
    /// its messages no longer authenticate.
    pub fn open(&mut self, template: &WidgetTemplate) -> Result<SandboxDocument, HostError> {
        let template = template.normalized(&self.config.limits)?;
        self.close();

        let session = self.sessions.open(template);
        let document = sandbox::build(
            session.template(),
            session.token(),
            None,
            &DocumentOptions::from(&self.config),
        )?;
        info!(
            "Widget {}: session {} opened for template {}",
            self.widget_id,
            session.generation(),
            session.template().id
        );
        Ok(document)
    }

    /// Reopens only if `template` differs in identity from the current
    /// one. The current payload is carried over to the new session.
    ///
    /// A name or params edit keeps the session and its token; a buffered
    /// payload is resent with the new params.
    pub fn ensure_template(
        &mut self,
        template: &WidgetTemplate,
        now: Instant,
    ) -> Result<Option<SandboxDocument>, HostError> {
        let template = template.normalized(&self.config.limits)?;
        let carried = match self.sessions.current_mut() {
            Some(session) if session.template().same_identity(&template) => {
                if session.replace_template(template) {
                    debug!("Widget {}: template params changed, resending", self.widget_id);
                    self.deliver(Trigger::PayloadChanged, now);
                }
                return Ok(None);
            }
            Some(session) => session.last_payload().cloned(),
            None => None,
        };
        let document = self.open(&template)?;
        if let (Some(payload), Some(session)) = (carried, self.sessions.current_mut()) {
            session.set_payload(payload.data, payload.params);
        }
        Ok(Some(document))
    }

    /// Closes the current session: cancels its timers, forgets its
    /// payload, pending captures and frame.
    pub fn close(&mut self) {
        self.delivery.cancel(&mut self.scheduler);
        if let Some(generation) = self.sessions.close() {
            let dropped = self.scheduler.cancel_owner(generation);
            debug!(
                "Widget {}: session {generation} closed, {dropped} timers dropped",
                self.widget_id
            );
        }
        self.pending_captures.clear();
        self.frame = None;
    }

    pub fn attach(&mut self, frame: Box<dyn GuestFrame>) {
        debug!("Widget {}: frame attached", self.widget_id);
        self.frame = Some(frame);
    }

    /// Detaches the frame (unmount or reload). The session and its payload
    /// survive; the next `ready` redelivers.
    pub fn detach(&mut self) {
        debug!("Widget {}: frame detached", self.widget_id);
        self.delivery.cancel(&mut self.scheduler);
        self.frame = None;
    }

    // ── Outbound ────────────────────────────────────────────

    fn post(&mut self, envelope: &Envelope) -> bool {
        let Some(frame) = self.frame.as_mut() else {
            return false;
        };
        match frame.post(envelope) {
            Ok(()) => true,
            Err(e) => {
                // Missed delivery; the retry ladder covers it
                debug!("Widget {}: {e}", self.widget_id);
                false
            }
        }
    }

    fn deliver(&mut self, trigger: Trigger, now: Instant) {
        let attached = self.frame.is_some();
        let Some(session) = self.sessions.current_mut() else {
            return;
        };
        if let Some(envelope) =
            self.delivery
                .trigger(trigger, session, attached, &mut self.scheduler, now)
        {
            self.post(&envelope);
        }
    }

    /// The only host-side mutation point for widget data.
    pub fn set_payload(&mut self, data: Value, params: Value, now: Instant) -> Result<(), HostError> {
        let session = self.sessions.current_mut().ok_or(HostError::NoSession)?;
        session.set_payload(data, params);
        self.deliver(Trigger::PayloadChanged, now);
        Ok(())
    }

    /// Delivers a statistics snapshot with the template's own params.
    pub fn set_context(&mut self, context: &WidgetDataContext, now: Instant) -> Result<(), HostError> {
        let params = self
            .sessions
            .current()
            .ok_or(HostError::NoSession)?
            .template()
            .params
            .clone();
        self.set_payload(context.to_value(), params, now)
    }

    /// Asks the guest for a capture. Returns the request id the matching
    /// [`HostNotice::Captured`] will carry.
    pub fn request_capture(&mut self, pixel_ratio: f64, hide_numbers: bool) -> Result<String, HostError> {
        let token = self
            .sessions
            .current_token()
            .ok_or(HostError::NoSession)?
            .as_str()
            .to_string();
        if self.frame.is_none() {
            return Err(HostError::Detached);
        }

        let request = CaptureRequest::new(pixel_ratio, hide_numbers);
        let request_id = request.request_id.clone();
        if !self.post(&Envelope::new(token, Message::Capture(request))) {
            return Err(HostError::Detached);
        }
        if self.pending_captures.len() >= MAX_PENDING_CAPTURES {
            if let Some(stale) = self.pending_captures.pop_front() {
                debug!("Widget {}: forgetting unanswered capture {stale}", self.widget_id);
            }
        }
        self.pending_captures.push_back(request_id.clone());
        Ok(request_id)
    }

    fn take_pending_capture(&mut self, request_id: &str) -> bool {
        match self.pending_captures.iter().position(|id| id == request_id) {
            Some(index) => self.pending_captures.remove(index).is_some(),
            None => false,
        }
    }

    /// Fires due retry timers.
    pub fn fire_due(&mut self, now: Instant) {
        let attached = self.frame.is_some();
        for fired in self.scheduler.take_due(now) {
            let HostTimer::Retry { rung } = fired.event;
            let step = match self.sessions.current() {
                Some(session) if session.generation() == fired.owner => {
                    self.delivery.on_retry(fired.id, rung, session, attached)
                }
                _ => RetryStep::Skip,
            };
            if let RetryStep::Resend { envelope, last } = step {
                self.post(&envelope);
                if last {
                    debug!(
                        "Widget {}: last delivery retry sent, giving up after this one",
                        self.widget_id
                    );
                }
            }
        }
    }

    // ── Inbound ─────────────────────────────────────────────

    /// Handles an inbound envelope. Anything that does not authenticate
    /// against the current session is dropped.
    pub fn receive(&mut self, raw: &Value, now: Instant) -> Option<HostNotice> {
        let token = self.sessions.current_token()?.as_str().to_string();
        let message = match Envelope::open(raw, &token) {
            Ok(message) => message,
            Err(EnvelopeError::MissingMarker) => return None,
            Err(e) => {
                debug!("Widget {}: dropped envelope: {e}", self.widget_id);
                return None;
            }
        };
        self.dispatch(message, now)
    }

    /// Like [`WidgetHost::receive`], from raw JSON text.
    pub fn receive_str(&mut self, raw: &str, now: Instant) -> Option<HostNotice> {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => self.receive(&value, now),
            Err(e) => {
                debug!("Widget {}: dropped non-JSON message: {e}", self.widget_id);
                None
            }
        }
    }

    fn dispatch(&mut self, message: Message, now: Instant) -> Option<HostNotice> {
        match message {
            Message::Ready => {
                self.deliver(Trigger::GuestReady, now);
                None
            }
            Message::RequestUpdate => {
                self.deliver(Trigger::UpdateRequested, now);
                None
            }
            Message::Ack(_) => {
                let session = self.sessions.current_mut()?;
                if session.last_payload().is_none() {
                    return None;
                }
                let cancelled = self.delivery.on_ack(session, &mut self.scheduler);
                debug!(
                    "Widget {}: ack received, {cancelled} retries cancelled",
                    self.widget_id
                );
                Some(HostNotice::Acked)
            }
            Message::Resize(resize) => {
                let session = self.sessions.current_mut()?;
                if session.template().height_px.is_some() {
                    return None;
                }
                if session.guest_height == Some(resize.height) {
                    return None;
                }
                session.guest_height = Some(resize.height);
                Some(HostNotice::Resized {
                    height: resize.height,
                })
            }
            Message::Error(err) => {
                warn!("Widget {} guest error: {}", self.widget_id, err.message);
                Some(HostNotice::GuestError {
                    message: err.message,
                })
            }
            Message::Log(log) => {
                let line = log.args.join(" ");
                match log.level {
                    LogLevel::Log => info!(widget = %self.widget_id, "guest: {line}"),
                    LogLevel::Warn => warn!(widget = %self.widget_id, "guest: {line}"),
                    LogLevel::Error => error!(widget = %self.widget_id, "guest: {line}"),
                }
                None
            }
            Message::CaptureResult(result) => {
                if !self.take_pending_capture(&result.request_id) {
                    debug!(
                        "Widget {}: capture result for unknown request {}",
                        self.widget_id, result.request_id
                    );
                    return None;
                }
                if let CaptureOutcome::Failed(ref reason) = result.outcome {
                    warn!("Widget {}: capture failed: {reason}", self.widget_id);
                }
                Some(HostNotice::Captured(result))
            }
            Message::Update(_) | Message::Capture(_) => {
                debug!(
                    "Widget {}: ignoring host-bound message kind from guest",
                    self.widget_id
                );
                None
            }
        }
    }
}
