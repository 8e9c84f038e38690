//! Remote session contract
//!
//! The pipeline drives a [`SessionConnector`] from the scheduler thread:
//! connect → join on startup, publish once per attached track, and
//! unpublish → leave → disconnect on teardown. The signaling wire format is
//! the connector's business.

pub mod rtc;

use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::pipeline::queue::{ConsumerId, TrackConsumer};
use crate::pipeline::types::MediaKind;

/// Secrets presented on connect
#[derive(Clone, Default)]
pub struct Credentials {
    pub api_secret: String,
    pub token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_secret", &(!self.api_secret.is_empty()).then_some("***"))
            .field("token", &(!self.token.is_empty()).then_some("***"))
            .finish()
    }
}

/// An open connection to the signaling server.
///
/// Owned by the scheduler thread. Connectors keep their own state in `data`.
pub struct Session {
    pub id: String,
    pub server_url: String,
    data: Option<Arc<dyn Any + Send + Sync>>,
}

impl Session {
    pub fn new(id: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            server_url: server_url.into(),
            data: None,
        }
    }

    pub fn with_data<T: Any + Send + Sync>(mut self, data: T) -> Self {
        self.data = Some(Arc::new(data));
        self
    }

    pub fn data<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.data.as_deref().and_then(|d| d.downcast_ref::<T>())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("server_url", &self.server_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinResult {
    pub room_id: i64,
    pub participant_id: String,
}

/// A track handed to the connector for publishing
pub struct OutboundTrack {
    pub id: ConsumerId,
    pub kind: MediaKind,
    pub consumer: TrackConsumer,
}

impl fmt::Debug for OutboundTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Client side of the signaling session
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, url: &str, credentials: &Credentials) -> anyhow::Result<Session>;

    async fn join(
        &self,
        session: &Session,
        room_id: i64,
        display_name: &str,
    ) -> anyhow::Result<JoinResult>;

    /// Start sending `tracks`; `false` means the server refused
    async fn publish(&self, session: &Session, tracks: Vec<OutboundTrack>) -> anyhow::Result<bool>;

    async fn unpublish(&self, session: &Session) -> anyhow::Result<bool>;

    async fn leave(&self, session: &Session) -> anyhow::Result<bool>;

    async fn disconnect(&self, session: Session) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_data_downcast() {
        let session = Session::new("7", "wss://sfu.example.test").with_data(99u32);
        assert_eq!(session.data::<u32>(), Some(&99));
        assert!(session.data::<String>().is_none());
        assert!(format!("{:?}", session).contains("sfu.example.test"));
    }

    #[test]
    fn test_credentials_debug_hides_secrets() {
        let credentials = Credentials {
            api_secret: String::from("hunter2"),
            token: String::new(),
        };
        let shown = format!("{:?}", credentials);
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("***"));
    }
}
