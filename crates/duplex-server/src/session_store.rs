//! Session store: per-`session_id` persona, history, sampling and
//! cache-warm fingerprints.
//!
//! Sessions outlive connections. Any connection presenting a `session_id` may
//! update it; the last writer wins and a change of writer is logged as an
//! ownership takeover. Changing the persona invalidates the history
//! fingerprint, since warmed history is only valid for the persona it was
//! warmed against.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use duplex_core::protocol::StartRequest;
use duplex_core::sampling::SamplingOverrides;
use duplex_core::{ConnectionId, SessionId};
use duplex_settings::SessionSettings;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::rate_limit::RateLimiter;

/// Field separator inside fingerprint input.
const SEPARATOR: &[u8] = &[0x1f];

/// Session store limits.
#[derive(Clone, Debug)]
pub struct SessionStoreConfig {
    /// Sessions unseen for this long are evicted by the sweeper.
    pub idle_ttl: Duration,
    /// Sweep period.
    pub sweep_interval: Duration,
    /// Upper bound; inserting beyond it evicts the least recently seen.
    pub max_sessions: usize,
}

impl SessionStoreConfig {
    /// Build from settings.
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            idle_ttl: Duration::from_secs(settings.idle_ttl_secs),
            sweep_interval: Duration::from_secs(settings.sweep_interval_secs.max(1)),
            max_sessions: settings.max_sessions.max(1),
        }
    }
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self::from_settings(&SessionSettings::default())
    }
}

/// Persona fields of a session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Persona {
    /// Persona description.
    pub text: Option<String>,
    /// Speaking style.
    pub style: Option<String>,
    /// Gender.
    pub gender: Option<String>,
}

impl Persona {
    /// Fingerprint of text, style and gender.
    pub fn fingerprint(&self) -> String {
        fingerprint(&[
            self.text.as_deref().unwrap_or_default(),
            self.style.as_deref().unwrap_or_default(),
            self.gender.as_deref().unwrap_or_default(),
        ])
    }

    /// Persona rendered for an engine prompt, if any field is set.
    pub fn render(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(text) = self.text.as_deref().filter(|t| !t.trim().is_empty()) {
            parts.push(text.trim().to_string());
        }
        if let Some(style) = self.style.as_deref().filter(|s| !s.trim().is_empty()) {
            parts.push(format!("Style: {}", style.trim()));
        }
        if let Some(gender) = self.gender.as_deref().filter(|g| !g.trim().is_empty()) {
            parts.push(format!("Gender: {}", gender.trim()));
        }
        (!parts.is_empty()).then(|| parts.join("\n"))
    }
}

/// Stored state of one session.
#[derive(Clone, Debug)]
pub struct Session {
    /// Persona fields.
    pub persona: Persona,
    /// Opaque user identity tag.
    pub user_identity: Option<String>,
    /// Conversation history.
    pub history_text: Option<String>,
    /// Accumulated sampling overrides.
    pub sampling: SamplingOverrides,
    /// Last warmed persona fingerprint.
    pub persona_fingerprint: Option<String>,
    /// Last warmed history fingerprint.
    pub history_fingerprint: Option<String>,
    /// Connection that last wrote this session.
    pub owner: Option<ConnectionId>,
    /// Last time any connection touched the session.
    pub last_seen: Instant,
}

impl Session {
    fn new(now: Instant) -> Self {
        Self {
            persona: Persona::default(),
            user_identity: None,
            history_text: None,
            sampling: SamplingOverrides::default(),
            persona_fingerprint: None,
            history_fingerprint: None,
            owner: None,
            last_seen: now,
        }
    }

    /// Persona after applying the persona fields of `request`.
    fn persona_after(&self, request: &StartRequest) -> Persona {
        Persona {
            text: request.persona_text.clone().or_else(|| self.persona.text.clone()),
            style: request.persona_style.clone().or_else(|| self.persona.style.clone()),
            gender: request.gender.clone().or_else(|| self.persona.gender.clone()),
        }
    }

    /// Replace the persona. A change drops both warm fingerprints.
    fn set_persona(&mut self, persona: Persona) -> bool {
        if persona == self.persona {
            return false;
        }
        self.persona = persona;
        self.persona_fingerprint = None;
        self.history_fingerprint = None;
        true
    }

    /// Fingerprint of the current persona, user identity and history.
    fn history_fingerprint_for(&self, history: &str) -> String {
        fingerprint(&[
            &self.persona.fingerprint(),
            self.user_identity.as_deref().unwrap_or_default(),
            history,
        ])
    }
}

/// Everything a turn needs from its session, captured at `start`.
#[derive(Clone, Debug, PartialEq)]
pub struct TurnContext {
    /// Rendered persona.
    pub persona: Option<String>,
    /// History text.
    pub history: Option<String>,
    /// User identity tag.
    pub user_identity: Option<String>,
    /// Effective sampling overrides.
    pub sampling: SamplingOverrides,
    /// Whether this start changed the persona.
    pub persona_changed: bool,
}

/// Result of a `warm_*` message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WarmOutcome {
    /// The fingerprint now recorded.
    pub fingerprint: String,
    /// Whether it was already recorded.
    pub reused: bool,
}

/// Concurrent session map.
#[derive(Debug)]
pub struct SessionStore {
    sessions: DashMap<SessionId, Session>,
    config: SessionStoreConfig,
}

impl SessionStore {
    /// Create an empty store.
    pub fn new(config: SessionStoreConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
        }
    }

    /// Number of stored sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of a session.
    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// Whether applying `request` would change the stored persona.
    ///
    /// A new session only counts as a change when it sets persona fields.
    pub fn persona_would_change(&self, request: &StartRequest) -> bool {
        match self.sessions.get(&request.session_id) {
            Some(session) => session.persona_after(request) != session.persona,
            None => {
                request.persona_text.is_some()
                    || request.persona_style.is_some()
                    || request.gender.is_some()
            }
        }
    }

    /// Whether warming `chat_prompt` would record a new persona fingerprint.
    pub fn persona_warm_would_change(&self, id: &SessionId, chat_prompt: &str) -> bool {
        let (style, gender) = self
            .sessions
            .get(id)
            .map(|s| (s.persona.style.clone(), s.persona.gender.clone()))
            .unwrap_or_default();
        let candidate = Persona {
            text: Some(chat_prompt.to_string()),
            style,
            gender,
        }
        .fingerprint();
        self.sessions
            .get(id)
            .and_then(|s| s.persona_fingerprint.clone())
            .is_none_or(|current| current != candidate)
    }

    /// Apply a `start` request and capture the turn context.
    pub fn apply_start(&self, connection: &ConnectionId, request: &StartRequest) -> TurnContext {
        let mut session = self.entry(&request.session_id, connection);

        let persona = session.persona_after(request);
        let persona_changed = session.set_persona(persona);
        if let Some(identity) = &request.user_identity {
            if session.user_identity.as_ref() != Some(identity) {
                session.user_identity = Some(identity.clone());
                session.history_fingerprint = None;
            }
        }
        if let Some(history) = &request.history_text {
            session.history_text = Some(history.clone());
        }
        if let Some(sampling) = &request.sampling {
            session.sampling.merge(sampling);
        }
        if persona_changed {
            debug!(session_id = %request.session_id, "session persona changed");
        }

        TurnContext {
            persona: session.persona.render(),
            history: session.history_text.clone(),
            user_identity: session.user_identity.clone(),
            sampling: session.sampling.clone(),
            persona_changed,
        }
    }

    /// Record the persona fingerprint for `chat_prompt`.
    pub fn warm_persona(
        &self,
        connection: &ConnectionId,
        id: &SessionId,
        chat_prompt: &str,
    ) -> WarmOutcome {
        let mut session = self.entry(id, connection);
        let persona = Persona {
            text: Some(chat_prompt.to_string()),
            ..session.persona.clone()
        };
        let fingerprint = persona.fingerprint();
        if session.persona == persona
            && session.persona_fingerprint.as_deref() == Some(fingerprint.as_str())
        {
            return WarmOutcome {
                fingerprint,
                reused: true,
            };
        }
        let _ = session.set_persona(persona);
        session.persona_fingerprint = Some(fingerprint.clone());
        WarmOutcome {
            fingerprint,
            reused: false,
        }
    }

    /// Record the history fingerprint for `history_text`.
    pub fn warm_history(
        &self,
        connection: &ConnectionId,
        id: &SessionId,
        history_text: &str,
    ) -> WarmOutcome {
        let mut session = self.entry(id, connection);
        let fingerprint = session.history_fingerprint_for(history_text);
        session.history_text = Some(history_text.to_string());
        if session.history_fingerprint.as_deref() == Some(fingerprint.as_str()) {
            return WarmOutcome {
                fingerprint,
                reused: true,
            };
        }
        session.history_fingerprint = Some(fingerprint.clone());
        WarmOutcome {
            fingerprint,
            reused: false,
        }
    }

    /// Clear ownership held by a closing connection.
    pub fn release_connection(&self, connection: &ConnectionId) {
        for mut session in self.sessions.iter_mut() {
            if session.owner.as_ref() == Some(connection) {
                session.owner = None;
            }
        }
    }

    /// Evict sessions unseen for longer than the idle TTL.
    pub fn sweep_expired(&self, now: Instant) -> Vec<SessionId> {
        let ttl = self.config.idle_ttl;
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|s| s.owner.is_none() && now.saturating_duration_since(s.last_seen) >= ttl)
            .map(|s| s.key().clone())
            .collect();
        for id in &expired {
            let _ = self
                .sessions
                .remove_if(id, |_, s| s.owner.is_none() && now.saturating_duration_since(s.last_seen) >= ttl);
        }
        expired
    }

    /// Run [`sweep_expired`](Self::sweep_expired) periodically until `shutdown` fires.
    pub async fn run_sweeper(self: Arc<Self>, limiter: Arc<RateLimiter>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        let _ = interval.tick().await;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let evicted = self.sweep_expired(Instant::now());
                    for id in &evicted {
                        limiter.forget_session(id);
                    }
                    if !evicted.is_empty() {
                        info!(evicted = evicted.len(), remaining = self.len(), "expired sessions swept");
                    }
                }
            }
        }
    }

    /// Fetch or create a session, claim it for `connection` and touch it.
    fn entry(
        &self,
        id: &SessionId,
        connection: &ConnectionId,
    ) -> dashmap::mapref::one::RefMut<'_, SessionId, Session> {
        let now = Instant::now();
        if !self.sessions.contains_key(id) {
            self.evict_for_insert(id);
        }
        let mut session = self.sessions.entry(id.clone()).or_insert_with(|| Session::new(now));
        if let Some(previous) = session.owner.as_ref().filter(|owner| *owner != connection) {
            info!(
                session_id = %id,
                previous_owner = %previous,
                new_owner = %connection,
                "session ownership taken over"
            );
        }
        session.owner = Some(connection.clone());
        session.last_seen = now;
        session
    }

    fn evict_for_insert(&self, incoming: &SessionId) {
        while self.sessions.len() >= self.config.max_sessions {
            let oldest = self
                .sessions
                .iter()
                .filter(|s| s.key() != incoming)
                .min_by_key(|s| s.last_seen)
                .map(|s| s.key().clone());
            let Some(oldest) = oldest else { break };
            let _ = self.sessions.remove(&oldest);
            debug!(session_id = %oldest, "evicted least recently seen session");
        }
    }
}

fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(SEPARATOR);
        }
        hasher.update(part.as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::from_string(id)
    }

    fn sid(id: &str) -> SessionId {
        SessionId::from_string(id)
    }

    fn start(session: &str) -> StartRequest {
        StartRequest {
            session_id: sid(session),
            request_id: None,
            persona_text: None,
            persona_style: None,
            gender: None,
            user_identity: None,
            history_text: None,
            user_utterance: "hi".into(),
            sampling: None,
        }
    }

    fn store() -> SessionStore {
        SessionStore::new(SessionStoreConfig::default())
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = fingerprint(&["a", "b"]);
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(fp, fingerprint(&["ab", ""]));
    }

    #[tokio::test]
    async fn start_creates_and_merges() {
        let store = store();
        let mut req = start("s1");
        req.persona_text = Some("A pirate".into());
        req.sampling = Some(SamplingOverrides {
            temperature: Some(0.5),
            ..SamplingOverrides::default()
        });
        let ctx = store.apply_start(&conn("c1"), &req);
        assert!(ctx.persona_changed);
        assert_eq!(ctx.persona.as_deref(), Some("A pirate"));
        assert_eq!(ctx.sampling.temperature, Some(0.5));

        let mut next = start("s1");
        next.sampling = Some(SamplingOverrides {
            top_p: Some(0.9),
            ..SamplingOverrides::default()
        });
        let ctx = store.apply_start(&conn("c1"), &next);
        assert!(!ctx.persona_changed);
        assert_eq!(ctx.persona.as_deref(), Some("A pirate"));
        assert_eq!(ctx.sampling.temperature, Some(0.5));
        assert_eq!(ctx.sampling.top_p, Some(0.9));
    }

    #[tokio::test]
    async fn persona_change_invalidates_history_fingerprint() {
        let store = store();
        let c = conn("c1");
        let id = sid("s1");
        let _ = store.warm_history(&c, &id, "earlier talk");
        assert!(store.get(&id).unwrap().history_fingerprint.is_some());

        let mut req = start("s1");
        req.persona_text = Some("new persona".into());
        let _ = store.apply_start(&c, &req);
        assert!(store.get(&id).unwrap().history_fingerprint.is_none());
    }

    #[tokio::test]
    async fn warm_persona_reports_reuse() {
        let store = store();
        let c = conn("c1");
        let id = sid("s1");
        let first = store.warm_persona(&c, &id, "You are calm.");
        assert!(!first.reused);
        let second = store.warm_persona(&c, &id, "You are calm.");
        assert!(second.reused);
        assert_eq!(first.fingerprint, second.fingerprint);
        assert!(!store.persona_warm_would_change(&id, "You are calm."));
        assert!(store.persona_warm_would_change(&id, "You are loud."));
    }

    #[tokio::test]
    async fn history_fingerprint_depends_on_persona() {
        let store = store();
        let c = conn("c1");
        let id = sid("s1");
        let _ = store.warm_persona(&c, &id, "persona A");
        let a = store.warm_history(&c, &id, "same history");
        assert!(store.warm_history(&c, &id, "same history").reused);

        let _ = store.warm_persona(&c, &id, "persona B");
        let b = store.warm_history(&c, &id, "same history");
        assert!(!b.reused);
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[tokio::test]
    async fn start_persona_change_rekeys_history() {
        let store = store();
        let c = conn("c1");
        let id = sid("s1");
        let _ = store.warm_persona(&c, &id, "persona A");
        let a = store.warm_history(&c, &id, "h");

        let mut req = start("s1");
        req.persona_text = Some("persona B".into());
        assert!(store.apply_start(&c, &req).persona_changed);
        let b = store.warm_history(&c, &id, "h");
        assert!(!b.reused);
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[tokio::test]
    async fn rewarming_after_start_change_is_not_reused() {
        let store = store();
        let c = conn("c1");
        let id = sid("s1");
        let first = store.warm_persona(&c, &id, "persona A");

        let mut req = start("s1");
        req.persona_text = Some("persona B".into());
        let _ = store.apply_start(&c, &req);
        assert!(store.get(&id).unwrap().persona_fingerprint.is_none());
        assert!(store.persona_warm_would_change(&id, "persona A"));

        let again = store.warm_persona(&c, &id, "persona A");
        assert!(!again.reused);
        assert_eq!(again.fingerprint, first.fingerprint);
        let session = store.get(&id).unwrap();
        assert_eq!(session.persona.text.as_deref(), Some("persona A"));
        assert_eq!(session.persona_fingerprint, Some(first.fingerprint));
    }

    #[tokio::test]
    async fn persona_would_change_detection() {
        let store = store();
        let mut req = start("s1");
        assert!(!store.persona_would_change(&req));
        req.persona_text = Some("p".into());
        assert!(store.persona_would_change(&req));
        let _ = store.apply_start(&conn("c"), &req);
        assert!(!store.persona_would_change(&req));
        assert!(!store.persona_would_change(&start("s1")));
    }

    #[tokio::test]
    async fn last_writer_takes_ownership() {
        let store = store();
        let id = sid("shared");
        let _ = store.apply_start(&conn("c1"), &start("shared"));
        assert_eq!(store.get(&id).unwrap().owner, Some(conn("c1")));
        let _ = store.apply_start(&conn("c2"), &start("shared"));
        assert_eq!(store.get(&id).unwrap().owner, Some(conn("c2")));

        store.release_connection(&conn("c1"));
        assert_eq!(store.get(&id).unwrap().owner, Some(conn("c2")));
        store.release_connection(&conn("c2"));
        assert!(store.get(&id).unwrap().owner.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_only_idle_unowned_sessions() {
        let store = SessionStore::new(SessionStoreConfig {
            idle_ttl: Duration::from_secs(60),
            ..SessionStoreConfig::default()
        });
        let _ = store.apply_start(&conn("c1"), &start("idle"));
        let _ = store.apply_start(&conn("c2"), &start("owned"));
        store.release_connection(&conn("c1"));

        tokio::time::advance(Duration::from_secs(61)).await;
        let evicted = store.sweep_expired(Instant::now());
        assert_eq!(evicted, vec![sid("idle")]);
        assert!(store.get(&sid("owned")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_forgets_rate_windows_of_evicted_sessions() {
        let store = Arc::new(SessionStore::new(SessionStoreConfig {
            idle_ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            ..SessionStoreConfig::default()
        }));
        let limiter = Arc::new(RateLimiter::new(duplex_settings::RateLimitSettings::default()));
        let _ = store.apply_start(&conn("c"), &start("gone"));
        store.release_connection(&conn("c"));
        limiter.check_persona_update(&sid("gone")).unwrap();
        assert_eq!(limiter.tracked_sessions(), 1);

        let shutdown = CancellationToken::new();
        let sweeper = tokio::spawn(Arc::clone(&store).run_sweeper(Arc::clone(&limiter), shutdown.clone()));
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(store.is_empty());
        assert_eq!(limiter.tracked_sessions(), 0);

        shutdown.cancel();
        sweeper.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn max_sessions_evicts_least_recently_seen() {
        let store = SessionStore::new(SessionStoreConfig {
            max_sessions: 2,
            ..SessionStoreConfig::default()
        });
        let c = conn("c");
        let _ = store.apply_start(&c, &start("a"));
        tokio::time::advance(Duration::from_secs(1)).await;
        let _ = store.apply_start(&c, &start("b"));
        tokio::time::advance(Duration::from_secs(1)).await;
        let _ = store.apply_start(&c, &start("a"));
        tokio::time::advance(Duration::from_secs(1)).await;
        let _ = store.apply_start(&c, &start("c"));

        assert_eq!(store.len(), 2);
        assert!(store.get(&sid("a")).is_some());
        assert!(store.get(&sid("b")).is_none());
        assert!(store.get(&sid("c")).is_some());
    }

    #[test]
    fn persona_render_joins_fields() {
        let persona = Persona {
            text: Some("Kind guide".into()),
            style: Some("brief".into()),
            gender: None,
        };
        assert_eq!(persona.render().as_deref(), Some("Kind guide\nStyle: brief"));
        assert_eq!(Persona::default().render(), None);
    }
}
