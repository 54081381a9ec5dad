//! Session & token management.
//!
//! One [`SandboxSession`] exists per mounted widget instance. Opening a
//! new one (mount, or template identity change) always mints a fresh
//! 128-bit token, so envelopes from a reloading or residual frame can
//! never authenticate against the new session.
use std::collections::HashSet;
use std::fmt;

use rand::RngCore;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::protocol::UpdatePayload;
use crate::sandbox::WidgetTemplate;

const TOKEN_BYTES: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("session token must be {} lowercase hex characters", TOKEN_BYTES * 2)]
pub struct TokenError;

/// Opaque per-session authenticator carried by every envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        let well_formed = raw.len() == TOKEN_BYTES * 2
            && raw.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !well_formed {
            return Err(TokenError);
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Host-side state of one mounted widget.
#[derive(Debug)]
pub struct SandboxSession {
    generation: u64,
    token: SessionToken,
    template: WidgetTemplate,
    last_payload: Option<UpdatePayload>,
    /// Guest announced `ready` at least once.
    pub ready: bool,
    /// Guest acknowledged the current payload.
    pub acked: bool,
    /// Last height reported by the guest.
    pub guest_height: Option<u32>,
}

impl SandboxSession {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    pub fn template(&self) -> &WidgetTemplate {
        &self.template
    }

    pub fn last_payload(&self) -> Option<&UpdatePayload> {
        self.last_payload.as_ref()
    }

    /// Replaces the payload to deliver. The previous one is never sent again.
    pub fn set_payload(&mut self, data: Value, params: Value) {
        self.last_payload = Some(UpdatePayload { data, params });
        self.acked = false;
    }

    /// Swaps in an edit of the same template (name or params) without
    /// touching the token. A buffered payload takes the new params and
    /// becomes unacked; returns true in that case so the caller resends.
    pub fn replace_template(&mut self, template: WidgetTemplate) -> bool {
        let params_changed = self.template.params != template.params;
        self.template = template;
        match self.last_payload.as_mut() {
            Some(payload) if params_changed => {
                payload.params = self.template.params.clone();
                self.acked = false;
                true
            }
            _ => false,
        }
    }

    /// Height the frame should use: the template's fixed height, else the
    /// last guest report.
    pub fn effective_height(&self) -> Option<u32> {
        self.template.height_px.or(self.guest_height)
    }
}

/// Owns the current session of a widget slot.
#[derive(Debug, Default)]
pub struct SessionManager {
    next_generation: u64,
    issued: HashSet<SessionToken>,
    current: Option<SandboxSession>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a session for `template`, closing any current one.
    pub fn open(&mut self, template: WidgetTemplate) -> &mut SandboxSession {
        self.close();

        let mut token = SessionToken::generate();
        while self.issued.contains(&token) {
            token = SessionToken::generate();
        }
        self.issued.insert(token.clone());
        self.next_generation += 1;

        debug!(
            "Opened session {} for template {}",
            self.next_generation, template.id
        );

        self.current.insert(SandboxSession {
            generation: self.next_generation,
            token,
            template,
            last_payload: None,
            ready: false,
            acked: false,
            guest_height: None,
        })
    }

    /// Closes the current session. Returns its generation so the caller
    /// can cancel the timers it owns.
    pub fn close(&mut self) -> Option<u64> {
        let mut session = self.current.take()?;
        session.last_payload = None;
        session.acked = false;
        session.ready = false;
        debug!("Closed session {}", session.generation);
        Some(session.generation)
    }

    pub fn current(&self) -> Option<&SandboxSession> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut SandboxSession> {
        self.current.as_mut()
    }

    /// Token that inbound envelopes must carry, if a session is open.
    pub fn current_token(&self) -> Option<&SessionToken> {
        self.current.as_ref().map(|s| &s.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template(id: &str) -> WidgetTemplate {
        WidgetTemplate {
            id: id.into(),
            name: id.into(),
            ..WidgetTemplate::default()
        }
    }

    #[test]
    fn test_generated_token_is_128_bit_hex() {
        let token = SessionToken::generate();
        assert_eq!(token.as_str().len(), 32);
        assert!(SessionToken::parse(token.as_str()).is_ok());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(SessionToken::parse("").is_err());
        assert!(SessionToken::parse("0123456789ABCDEF0123456789ABCDEF").is_err());
        assert!(SessionToken::parse("0123456789abcdef").is_err());
        assert!(SessionToken::parse("0123456789abcdef0123456789abcdeg").is_err());
    }

    #[test]
    fn test_reopen_changes_token_and_generation() {
        let mut manager = SessionManager::new();
        let (first_token, first_gen) = {
            let s = manager.open(template("a"));
            (s.token().clone(), s.generation())
        };
        let s = manager.open(template("a"));
        assert_ne!(s.token(), &first_token);
        assert_eq!(s.generation(), first_gen + 1);
    }

    #[test]
    fn test_close_drops_payload() {
        let mut manager = SessionManager::new();
        manager.open(template("a")).set_payload(json!({"total": 1}), json!({}));
        assert_eq!(manager.close(), Some(1));
        assert!(manager.current().is_none());
        assert!(manager.current_token().is_none());
        assert_eq!(manager.close(), None);
    }

    #[test]
    fn test_set_payload_supersedes_and_clears_ack() {
        let mut manager = SessionManager::new();
        let s = manager.open(template("a"));
        s.set_payload(json!({"v": 1}), json!({}));
        s.acked = true;
        s.set_payload(json!({"v": 2}), json!({}));
        assert!(!s.acked);
        assert_eq!(s.last_payload().unwrap().data, json!({"v": 2}));
    }

    #[test]
    fn test_replace_template_keeps_token_and_reparams_payload() {
        let mut manager = SessionManager::new();
        let s = manager.open(template("a"));
        let token = s.token().clone();
        assert!(!s.replace_template(template("a")));

        s.set_payload(json!({"v": 1}), json!({}));
        s.acked = true;
        let mut edited = template("a");
        edited.params = json!({"goal": 5});
        assert!(s.replace_template(edited.clone()));
        assert_eq!(s.token(), &token);
        assert!(!s.acked);
        assert_eq!(s.last_payload().unwrap().params, json!({"goal": 5}));

        // Same params again: nothing to resend
        s.acked = true;
        assert!(!s.replace_template(edited));
        assert!(s.acked);
    }

    #[test]
    fn test_effective_height_prefers_template() {
        let mut manager = SessionManager::new();
        let mut t = template("a");
        t.height_px = Some(100);
        let s = manager.open(t);
        s.guest_height = Some(300);
        assert_eq!(s.effective_height(), Some(100));

        let s = manager.open(template("b"));
        assert_eq!(s.effective_height(), None);
        s.guest_height = Some(300);
        assert_eq!(s.effective_height(), Some(300));
    }
}
