//! Runs the embedded guest runtime against a scripted window.
//!
//! The document's three script blocks are evaluated in order in a JS
//! engine, on top of a small stand-in for the frame globals: a root
//! element, a parent that records `postMessage`, a bridge object, and
//! timers that only run when the test drains them.
use boa_engine::{Context, Source};
use serde_json::{json, Value};

use crate::host::session::SessionToken;
use crate::protocol::{Envelope, LogLevel, Message, UpdatePayload};
use crate::sandbox::{build, DocumentOptions, WidgetTemplate};

const WINDOW: &str = r#"
(function () {
  var listeners = {};
  var timeouts = [];
  var intervals = {};
  var nextTimer = 1;
  var bridgeCalls = [];
  var parent = {
    postMessage: function (message) { harness.posted.push(JSON.stringify(message)); }
  };
  var root = {
    id: 'widget-root',
    innerHTML: '',
    textContent: '',
    getBoundingClientRect: function () { return { height: 0 }; }
  };
  function bridge(name) {
    return { invoke: function (cmd) { bridgeCalls.push(name + ':' + cmd); } };
  }
  var harness = {
    posted: [],
    bridgeCalls: bridgeCalls,
    root: root,
    deliver: function (raw, source) {
      var event = { source: source === undefined ? parent : source, data: JSON.parse(raw) };
      (listeners.message || []).forEach(function (fn) { fn(event); });
    },
    flush: function () {
      while (timeouts.length) timeouts.shift()();
    },
    tick: function () {
      Object.keys(intervals).forEach(function (id) { if (intervals[id]) intervals[id](); });
      harness.flush();
    },
    intervals: function () { return Object.keys(intervals).length; }
  };
  globalThis.window = globalThis;
  globalThis.parent = parent;
  globalThis.document = {
    getElementById: function (id) { return id === root.id ? root : null; }
  };
  globalThis.addEventListener = function (type, fn) {
    (listeners[type] = listeners[type] || []).push(fn);
  };
  globalThis.setTimeout = function (fn) { timeouts.push(fn); return nextTimer++; };
  globalThis.setInterval = function (fn) { var id = nextTimer++; intervals[id] = fn; return id; };
  globalThis.clearInterval = function (id) { delete intervals[id]; };
  globalThis.__TAURI__ = bridge('__TAURI__');
  globalThis.__TAURI_INTERNALS__ = bridge('__TAURI_INTERNALS__');
  globalThis.ipc = { postMessage: function (m) { bridgeCalls.push('ipc:' + m); } };
  globalThis.__harness = harness;
})();
"#;

/// Bodies of the `<script>` blocks of a built document, in order.
fn script_blocks(source: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = source;
    while let Some(start) = rest.find("<script>") {
        let body = &rest[start + "<script>".len()..];
        let end = body.find("</script>").expect("unterminated script block");
        blocks.push(&body[..end]);
        rest = &body[end + "</script>".len()..];
    }
    blocks
}

struct GuestPage {
    ctx: Context,
    token: SessionToken,
}

impl GuestPage {
    fn load(template: &WidgetTemplate) -> Self {
        let token = SessionToken::generate();
        let doc = build(template, &token, None, &DocumentOptions::default()).unwrap();
        let mut ctx = Context::default();
        ctx.eval(Source::from_bytes(WINDOW)).unwrap();

        let blocks = script_blocks(&doc.source);
        assert_eq!(blocks.len(), 3);
        for (i, block) in blocks.iter().enumerate() {
            let result = ctx.eval(Source::from_bytes(block));
            // A throwing guest script does not stop the next block
            if i != 1 {
                result.unwrap();
            }
        }

        let mut page = Self { ctx, token };
        page.flush();
        page
    }

    fn eval(&mut self, code: &str) -> String {
        let value = self.ctx.eval(Source::from_bytes(code)).unwrap();
        value.to_string(&mut self.ctx).unwrap().to_std_string_escaped()
    }

    fn flush(&mut self) {
        self.eval("__harness.flush()");
    }

    fn tick(&mut self) {
        self.eval("__harness.tick()");
    }

    /// Everything the runtime posted to the parent, opened with the
    /// page's own token.
    fn posted(&mut self) -> Vec<Message> {
        let raw = self.eval("JSON.stringify(__harness.posted)");
        let list: Vec<String> = serde_json::from_str(&raw).unwrap();
        list.iter()
            .map(|e| Envelope::open_str(e, self.token.as_str()).unwrap())
            .collect()
    }

    fn acks(&mut self) -> usize {
        self.posted()
            .iter()
            .filter(|m| matches!(m, Message::Ack(_)))
            .count()
    }

    fn send(&mut self, token: &str, message: Message, from_parent: bool) {
        let raw = serde_json::to_string(&Envelope::new(token, message).to_json()).unwrap();
        let source = if from_parent { "" } else { ", {}" };
        self.eval(&format!("__harness.deliver({raw}{source})"));
        self.flush();
    }

    fn update(&mut self, data: Value) {
        let token = self.token.as_str().to_string();
        let message = Message::Update(UpdatePayload {
            data,
            params: json!({}),
        });
        self.send(&token, message, true);
    }

    fn root_text(&mut self) -> String {
        self.eval("__harness.root.textContent")
    }
}

fn template(html: &str, js: &str) -> WidgetTemplate {
    WidgetTemplate {
        id: "w1".into(),
        name: "Total".into(),
        html: html.into(),
        js: js.into(),
        ..WidgetTemplate::default()
    }
}

const SUM_RENDER: &str =
    "window.render = function (ctx) { ctx.root.textContent = String(ctx.helpers.sum(ctx.data.values)); };";

// ── Startup and rendering ───────────────────────────────────

#[test]
fn test_runtime_announces_then_renders_once() {
    let mut page = GuestPage::load(&template("<p>x</p>", SUM_RENDER));
    assert_eq!(
        page.posted(),
        vec![
            Message::Ready,
            Message::RequestUpdate,
            Message::Resize(crate::protocol::ResizePayload { height: 0 }),
        ]
    );
    assert_eq!(page.eval("__harness.root.innerHTML"), "<p>x</p>");

    page.update(json!({"values": [40, 2]}));
    assert_eq!(page.root_text(), "42");
    assert_eq!(page.acks(), 1);

    // Pulse ticks after the render neither re-announce nor re-ack
    page.tick();
    page.tick();
    assert_eq!(page.acks(), 1);
    assert_eq!(page.eval("__harness.intervals()"), "0");
}

#[test]
fn test_pulse_reannounces_until_first_update() {
    let mut page = GuestPage::load(&template("", SUM_RENDER));
    page.tick();
    page.tick();
    let ready = page
        .posted()
        .iter()
        .filter(|m| **m == Message::Ready)
        .count();
    assert_eq!(ready, 3);
    assert_eq!(page.acks(), 0);
}

#[test]
fn test_late_render_definition_gets_buffered_update() {
    let mut page = GuestPage::load(&template("", ""));
    page.update(json!({"values": [3, 4]}));
    assert_eq!(page.acks(), 0);

    page.eval(SUM_RENDER);
    page.flush();
    assert_eq!(page.root_text(), "7");
    assert_eq!(page.acks(), 1);
}

#[test]
fn test_throwing_render_reports_error_then_acks() {
    let mut page = GuestPage::load(&template("", "window.render = function () { throw new Error('bad data'); };"));
    page.update(json!({}));
    let posted = page.posted();
    let error_at = posted
        .iter()
        .position(|m| matches!(m, Message::Error(e) if e.message == "bad data"))
        .unwrap();
    let ack_at = posted.iter().position(|m| matches!(m, Message::Ack(_))).unwrap();
    assert!(error_at < ack_at);
    assert_eq!(page.acks(), 1);
}

// ── Authentication ──────────────────────────────────────────

#[test]
fn test_stale_token_update_is_ignored() {
    let mut page = GuestPage::load(&template("", SUM_RENDER));
    let stale = SessionToken::generate();
    page.send(
        stale.as_str(),
        Message::Update(UpdatePayload {
            data: json!({"values": [1]}),
            params: json!({}),
        }),
        true,
    );
    assert_eq!(page.root_text(), "");
    assert_eq!(page.acks(), 0);

    page.update(json!({"values": [5]}));
    assert_eq!(page.root_text(), "5");
}

#[test]
fn test_update_from_other_window_is_ignored() {
    let mut page = GuestPage::load(&template("", SUM_RENDER));
    let token = page.token.as_str().to_string();
    page.send(
        &token,
        Message::Update(UpdatePayload {
            data: json!({"values": [1]}),
            params: json!({}),
        }),
        false,
    );
    assert_eq!(page.acks(), 0);
}

// ── Confinement ─────────────────────────────────────────────

#[test]
fn test_guest_cannot_reach_host_bridges() {
    let js = "window.bridgesSeen = [typeof window.__TAURI__, typeof window.__TAURI_INTERNALS__, typeof window.ipc].join(',');\n\
              try { window.__TAURI__.invoke('read_file'); } catch (e) { console.error('bridge blocked'); }\n\
              try { __TAURI_INTERNALS__.invoke('read_file'); } catch (e) { console.warn('internals blocked'); }";
    let mut page = GuestPage::load(&template("", js));

    assert_eq!(page.eval("window.bridgesSeen"), "undefined,undefined,undefined");
    assert_eq!(page.eval("__harness.bridgeCalls.length"), "0");

    let logs: Vec<_> = page
        .posted()
        .into_iter()
        .filter_map(|m| match m {
            Message::Log(log) => Some((log.level, log.args)),
            _ => None,
        })
        .collect();
    assert_eq!(
        logs,
        vec![
            (LogLevel::Error, vec!["bridge blocked".to_string()]),
            (LogLevel::Warn, vec!["internals blocked".to_string()]),
        ]
    );
}

#[test]
fn test_escaped_script_openers_keep_meaning() {
    let js = "window.matched = [/<script\\b/i.test('<SCRIPT src=x>'), /a<!--/.test('xa<!--'), '<script>'.length].join(',');";
    let mut page = GuestPage::load(&template("", js));
    assert_eq!(page.eval("window.matched"), "true,true,8");
}

#[test]
fn test_unbalanced_markup_does_not_stop_runtime() {
    let mut page = GuestPage::load(&template("</div><!-- <textarea>", SUM_RENDER));
    page.update(json!({"values": [1, 1]}));
    assert_eq!(page.root_text(), "2");
    assert_eq!(page.eval("__harness.root.innerHTML"), "</div><!-- <textarea>");
}
