use crate::engine::{EngineError, EngineHandle};
use presence_core::{CoreError, SessionEvent};
use zbus::interface;

pub const BUS_NAME: &str = "org.freedesktop.Presence1";
pub const OBJECT_PATH: &str = "/org/freedesktop/Presence1";

/// D-Bus control interface for the Presence daemon.
///
/// Bus name: org.freedesktop.Presence1
/// Object path: /org/freedesktop/Presence1
pub struct PresenceService {
    engine: EngineHandle,
}

impl PresenceService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

fn to_fdo(e: EngineError) -> zbus::fdo::Error {
    match e {
        EngineError::Core(
            err @ (CoreError::UnknownIdentity(_) | CoreError::UnknownSession(_)),
        ) => zbus::fdo::Error::InvalidArgs(err.to_string()),
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

pub fn event_json(event: &SessionEvent) -> serde_json::Value {
    match event {
        SessionEvent::None => serde_json::json!({ "event": "none" }),
        SessionEvent::Opened {
            session_id,
            identity_id,
            check_in,
        } => serde_json::json!({
            "event": "opened",
            "session_id": session_id,
            "identity_id": identity_id,
            "check_in": check_in,
        }),
        SessionEvent::Closed {
            session_id,
            identity_id,
            check_out,
            duration,
        } => serde_json::json!({
            "event": "closed",
            "session_id": session_id,
            "identity_id": identity_id,
            "check_out": check_out,
            "duration_secs": duration.num_milliseconds() as f64 / 1000.0,
        }),
    }
}

#[interface(name = "org.freedesktop.Presence1")]
impl PresenceService {
    /// Return daemon status and registry statistics as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "engine": status,
        })
        .to_string())
    }

    /// Return registry and attendance statistics as JSON.
    async fn stats(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        serde_json::to_string(&status.stats).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Explicitly check out an identity. Returns the resulting session event.
    async fn depart(&self, identity_id: i64) -> zbus::fdo::Result<String> {
        tracing::info!(identity_id, "depart requested");
        let event = self.engine.depart(identity_id).await.map_err(to_fdo)?;
        Ok(event_json(&event).to_string())
    }

    /// Set the display name of an identity. An empty name clears it.
    async fn label(&self, identity_id: i64, name: &str) -> zbus::fdo::Result<String> {
        tracing::info!(identity_id, name, "label requested");
        let name = (!name.trim().is_empty()).then(|| name.trim().to_string());
        let identity = self
            .engine
            .label(identity_id, name)
            .await
            .map_err(to_fdo)?;
        Ok(serde_json::json!({
            "identity_id": identity.identity_id,
            "label": identity.label(),
            "visit_count": identity.visit_count,
        })
        .to_string())
    }

    /// Close sessions past the exit timeout now. Returns the closed sessions.
    async fn sweep(&self) -> zbus::fdo::Result<String> {
        let events = self.engine.sweep().await.map_err(to_fdo)?;
        Ok(serde_json::Value::Array(events.iter().map(event_json).collect()).to_string())
    }
}
