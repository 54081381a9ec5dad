//! Guest-side protocol state machine.
//!
//! Mirrors the browser runtime embedded by the document builder, without
//! any I/O: the embedder feeds it inbound messages, timer ticks and
//! layout changes, and it answers through a [`GuestContext`].
//!
//! Phases run `Booting → AwaitingFirstUpdate → Live`. `Live` lasts until
//! the context is torn down; there is no terminal message.
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::{debug, trace};

use super::dom::Element;
use super::helpers::Helpers;
use super::raster::{self, BlobStore, CaptureBounds, RasterBackend};
use crate::config::Config;
use crate::protocol::{
    AckPayload, CaptureRequest, CaptureResult, Envelope, ErrorPayload, LogLevel, LogPayload,
    Message, ResizePayload, UpdatePayload,
};
use crate::sandbox::document::ROOT_ID;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestPhase {
    Booting,
    AwaitingFirstUpdate,
    Live,
}

/// Everything a guest `render` call receives.
pub struct RenderContext<'a> {
    pub data: &'a Value,
    pub params: &'a Value,
    pub helpers: Helpers,
    pub root: &'a mut Element,
    /// Per-session scratch space that survives between renders.
    pub state: &'a mut Map<String, Value>,
}

/// The guest environment as seen by the router.
pub trait GuestContext {
    /// Sends an envelope to the host.
    fn post(&mut self, envelope: Envelope);

    /// Whether the guest has defined `render` yet.
    fn has_render(&self) -> bool;

    /// Invokes the guest's `render`. `Err` carries the thrown message.
    fn render(&mut self, ctx: RenderContext<'_>) -> Result<(), String>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuestOptions {
    pub fixed_height: Option<u32>,
    pub ready_pulse: Duration,
    pub bounds: CaptureBounds,
}

impl Default for GuestOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for GuestOptions {
    fn from(config: &Config) -> Self {
        Self {
            fixed_height: None,
            ready_pulse: config.guest.ready_pulse(),
            bounds: CaptureBounds::from(&config.capture),
        }
    }
}

pub struct GuestRouter<C, B> {
    token: String,
    options: GuestOptions,
    phase: GuestPhase,
    latest: Option<UpdatePayload>,
    delivery_seq: u64,
    rendered_seq: u64,
    root: Element,
    state: Map<String, Value>,
    last_height: Option<u32>,
    next_pulse: Option<Instant>,
    blobs: BlobStore,
    context: C,
    backend: B,
}

impl<C: GuestContext, B: RasterBackend> GuestRouter<C, B> {
    pub fn new(token: impl Into<String>, options: GuestOptions, context: C, backend: B) -> Self {
        Self {
            token: token.into(),
            options,
            phase: GuestPhase::Booting,
            latest: None,
            delivery_seq: 0,
            rendered_seq: 0,
            root: Element::new("div").with_attr("id", ROOT_ID),
            state: Map::new(),
            last_height: None,
            next_pulse: None,
            blobs: BlobStore::new(),
            context,
            backend,
        }
    }

    pub fn phase(&self) -> GuestPhase {
        self.phase
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    /// Guest markup lands here before `start`.
    pub fn root_mut(&mut self) -> &mut Element {
        &mut self.root
    }

    pub fn state(&self) -> &Map<String, Value> {
        &self.state
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// When the next startup pulse is due, if one is scheduled.
    pub fn next_pulse(&self) -> Option<Instant> {
        self.next_pulse
    }

    /// Called once guest code has run. A top-level throw is reported but
    /// does not hold back the lifecycle.
    pub fn start(&mut self, guest_result: Result<(), String>, now: Instant) {
        if self.phase != GuestPhase::Booting {
            return;
        }
        if let Err(message) = guest_result {
            self.post(Message::Error(ErrorPayload { message }));
        }
        self.phase = GuestPhase::AwaitingFirstUpdate;
        self.announce();
        self.ensure_pulse(now);
        self.try_render();
    }

    /// Startup pulse tick. Re-announces until the first update, and
    /// retries a pending render in case `render` appeared meanwhile.
    pub fn on_pulse(&mut self, now: Instant) {
        if self.next_pulse.is_none() {
            return;
        }
        if self.phase == GuestPhase::AwaitingFirstUpdate {
            self.announce();
        }
        self.try_render();
        if self.phase == GuestPhase::Live && self.rendered_seq == self.delivery_seq {
            self.next_pulse = None;
        } else {
            self.next_pulse = Some(now + self.options.ready_pulse);
        }
    }

    /// The guest just assigned `render`.
    pub fn on_render_defined(&mut self) {
        self.try_render();
    }

    /// Inbound message from the host. Anything without the marker and
    /// this session's token is dropped silently.
    pub fn receive(&mut self, raw: &str, now: Instant) {
        let message = match Envelope::open_str(raw, &self.token) {
            Ok(message) => message,
            Err(e) => {
                trace!("Dropping inbound message: {e}");
                return;
            }
        };

        match message {
            Message::Update(payload) => {
                self.latest = Some(payload);
                self.delivery_seq += 1;
                self.phase = GuestPhase::Live;
                self.ensure_pulse(now);
                self.try_render();
            }
            Message::Capture(request) => self.handle_capture(&request),
            other => debug!("Ignoring {} from host", other.kind()),
        }
    }

    /// Intrinsic height of the document changed.
    pub fn on_layout(&mut self, height: u32) {
        if self.options.fixed_height.is_some() || self.last_height == Some(height) {
            return;
        }
        self.last_height = Some(height);
        self.post(Message::Resize(ResizePayload { height }));
    }

    /// Intercepted `console.log/warn/error`.
    pub fn on_console(&mut self, level: LogLevel, args: &[Value]) {
        let args = args.iter().map(stringify).collect();
        self.post(Message::Log(LogPayload { level, args }));
    }

    pub fn on_uncaught(&mut self, message: &str) {
        let message = if message.is_empty() {
            "Script error".to_string()
        } else {
            message.to_string()
        };
        self.post(Message::Error(ErrorPayload { message }));
    }

    pub fn on_unhandled_rejection(&mut self, reason: &Value) {
        let message = format!("Unhandled rejection: {}", stringify(reason));
        self.post(Message::Error(ErrorPayload { message }));
    }

    fn announce(&mut self) {
        self.post(Message::Ready);
        self.post(Message::RequestUpdate);
    }

    fn ensure_pulse(&mut self, now: Instant) {
        if self.next_pulse.is_none() {
            self.next_pulse = Some(now + self.options.ready_pulse);
        }
    }

    /// Renders the latest delivery if it has not been rendered and
    /// `render` exists. Acks once per delivery, even when `render` throws.
    fn try_render(&mut self) {
        let Some(latest) = self.latest.as_ref() else {
            return;
        };
        if self.rendered_seq == self.delivery_seq || !self.context.has_render() {
            return;
        }
        self.rendered_seq = self.delivery_seq;

        let outcome = self.context.render(RenderContext {
            data: &latest.data,
            params: &latest.params,
            helpers: Helpers,
            root: &mut self.root,
            state: &mut self.state,
        });
        if let Err(message) = outcome {
            self.post(Message::Error(ErrorPayload { message }));
        }
        let ts = chrono::Utc::now().timestamp_millis();
        self.post(Message::Ack(AckPayload { ts }));
    }

    fn handle_capture(&mut self, request: &CaptureRequest) {
        let result = match raster::capture(
            &self.root,
            request,
            &self.options.bounds,
            &self.backend,
            &mut self.blobs,
        ) {
            Ok(image) => CaptureResult::image(request.request_id.clone(), image),
            Err(e) => {
                debug!("Capture {} failed: {e}", request.request_id);
                CaptureResult::failed(request.request_id.clone(), e.to_string())
            }
        };
        self.post(Message::CaptureResult(result));
    }

    fn post(&mut self, message: Message) {
        self.context.post(Envelope::new(self.token.clone(), message));
    }
}

/// Strings pass through, everything else is JSON-encoded.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
