use std::sync::Arc;
use std::time::Instant;

use crate::auth::{CredentialValidator, JwtValidator};
use crate::config::PushConfig;
use crate::dispatcher::PushDispatcher;
use crate::lifecycle::SessionConfig;
use crate::registry::SessionRegistry;

/// Shared gateway state, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    /// Live connections, keyed by user.
    pub registry: Arc<SessionRegistry>,
    /// Fan-out over `registry`.
    pub dispatcher: PushDispatcher,
    /// Checks upgrade credentials.
    pub validator: Arc<dyn CredentialValidator>,
    /// Heartbeat and write-timeout policy for new sessions.
    pub session: SessionConfig,
    /// WebSocket read/write buffer size in bytes.
    pub buffer_size: usize,
    /// Bearer key for the HTTP push trigger; `None` disables it.
    pub push_key: Option<Arc<str>>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(validator: Arc<dyn CredentialValidator>) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        Self {
            dispatcher: PushDispatcher::new(registry.clone()),
            registry,
            validator,
            session: SessionConfig::default(),
            buffer_size: 1024,
            push_key: None,
            start_time: Instant::now(),
        }
    }

    pub fn from_config(config: &PushConfig) -> Self {
        let validator = Arc::new(JwtValidator::new(config.auth.jwt_secret.as_bytes()));
        let mut state = Self::new(validator).with_session(config.session_config());
        state.buffer_size = config.transport.buffer_size;
        state.push_key = config.auth.push_key.as_deref().map(Arc::from);
        state
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_push_key(mut self, key: impl Into<Arc<str>>) -> Self {
        self.push_key = Some(key.into());
        self
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
