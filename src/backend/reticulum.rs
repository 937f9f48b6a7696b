//! Mesh backend adapter.
//!
//! Wraps the mesh link layer behind the uniform backend contract. The
//! server binds an inbound destination, announces it on an interval, and
//! treats each accepted link as one session. The client rebuilds the
//! server's destination from the published hash and public key and opens a
//! link on demand, one operation per connection, keeping the airwaves
//! clear between exchanges.

use super::{BackendError, BackendStatus};
use crate::config::MeshConfig;
use crate::mesh::{self, Announcer, Identity, Link, MeshListener};
use crate::session::Session;
use crate::types::{Callsign, SessionState};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct ReticulumBackend {
    is_server: bool,
    cfg: MeshConfig,
    identity: Identity,
    listener: Option<MeshListener>,
    announce_task: Option<JoinHandle<()>>,
    /// The one live link; sessions map onto links one to one.
    link: Option<Link>,
    pub(crate) status: BackendStatus,
}

impl ReticulumBackend {
    /// Load (or mint) the persistent identity and, on the server, bring up
    /// the destination and its announcement loop.
    pub async fn new(cfg: MeshConfig, is_server: bool) -> Result<Self, BackendError> {
        let identity = Identity::load_or_create(&cfg.identity_path)?;
        let mut backend = Self {
            is_server,
            cfg,
            identity,
            listener: None,
            announce_task: None,
            link: None,
            status: BackendStatus::Disconnected,
        };
        if is_server {
            backend.bind_destination().await?;
        }
        Ok(backend)
    }

    async fn bind_destination(&mut self) -> Result<(), BackendError> {
        if self.listener.is_some() {
            return Ok(());
        }
        let listener = MeshListener::bind(&self.identity, &self.cfg.listen_addr).await?;
        let port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
        self.listener = Some(listener);

        let announcer = Announcer::new(&self.identity, port.saturating_add(1)).await?;
        let interval = Duration::from_secs(self.cfg.announce_interval.max(60));
        self.announce_task = Some(tokio::spawn(announcer.run(interval)));
        Ok(())
    }

    /// Bound listen address, for publishing alongside the destination.
    pub fn listen_addr(&self) -> Option<String> {
        self.listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|a| a.to_string())
    }

    pub fn destination_hash_hex(&self) -> String {
        hex::encode(mesh::destination_hash(
            mesh::DESTINATION_NAME,
            &self.identity.public,
        ))
    }

    pub fn public_key_hex(&self) -> String {
        self.identity.public_key_hex()
    }

    /// Server: block until a client link arrives. Client: dial the
    /// published destination. The callsign argument only labels the
    /// session; mesh addressing is by destination hash.
    pub async fn connect(&mut self, _remote: Option<&Callsign>) -> Result<Session, BackendError> {
        self.set_status(BackendStatus::Connecting);
        let link = if self.is_server {
            self.bind_destination().await?;
            info!(target: "hamstr::session", "Server waiting for incoming mesh link");
            self.listener
                .as_mut()
                .expect("destination bound above")
                .accept()
                .await?
        } else {
            let hash = self.cfg.server_hash.as_deref().ok_or_else(|| {
                BackendError::Config("mesh client needs the server destination hash".into())
            })?;
            let pubkey = self.cfg.server_pubkey.as_deref().ok_or_else(|| {
                BackendError::Config("mesh client needs the server public key".into())
            })?;
            let addr = self.cfg.server_addr.as_deref().ok_or_else(|| {
                BackendError::Config("mesh client needs a server address".into())
            })?;
            info!(target: "hamstr::session", "Connecting to mesh destination {}", &hash[..16.min(hash.len())]);
            mesh::link_to(
                addr,
                hash,
                pubkey,
                Duration::from_secs(self.cfg.link_timeout),
            )
            .await?
        };

        let mut session = Session::new(Callsign::new("MESH", 0).expect("static callsign"));
        session.id = link.id.clone();
        session.state = SessionState::Connected;
        self.link = Some(link);
        self.set_status(BackendStatus::Connected);
        Ok(session)
    }

    pub async fn send_data(&mut self, session: &mut Session, data: &[u8]) -> Result<(), BackendError> {
        let link = self.link.as_mut().ok_or(BackendError::NotConnected)?;
        info!(target: "hamstr::packet", "Sending {} bytes over mesh link", data.len());
        link.send(data).await?;
        session.touch();
        Ok(())
    }

    pub async fn receive_data(
        &mut self,
        session: &mut Session,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, BackendError> {
        let link = self.link.as_mut().ok_or(BackendError::NotConnected)?;
        match link.recv(timeout).await {
            Some(data) => {
                info!(target: "hamstr::packet", "Mesh link delivered {} bytes", data.len());
                session.touch();
                Ok(Some(data))
            }
            None if !link.is_active() => Err(BackendError::ConnectionClosed),
            None => Ok(None),
        }
    }

    pub async fn disconnect(&mut self, session: &mut Session) -> Result<(), BackendError> {
        if let Some(mut link) = self.link.take() {
            link.teardown().await;
        }
        session.state = SessionState::Disconnected;
        self.set_status(BackendStatus::Disconnected);
        info!(target: "hamstr::session", "DISCONNECTED");
        Ok(())
    }

    pub fn is_connected(&self, session: &Session) -> bool {
        session.is_connected() && self.link.as_ref().is_some_and(Link::is_active)
    }

    pub async fn shutdown(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.teardown().await;
        }
        if let Some(task) = self.announce_task.take() {
            task.abort();
        }
        self.listener = None;
        self.set_status(BackendStatus::Disconnected);
    }

    fn set_status(&mut self, status: BackendStatus) {
        if self.status != status {
            info!(target: "hamstr::tnc", "Mesh backend status: {} -> {}", self.status, status);
            self.status = status;
        }
    }
}

impl Drop for ReticulumBackend {
    fn drop(&mut self) {
        if let Some(task) = self.announce_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_identity(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("hamstr_retic_{}_{name}", std::process::id()))
    }

    async fn server_backend(name: &str) -> ReticulumBackend {
        let cfg = MeshConfig {
            identity_path: temp_identity(name),
            listen_addr: "127.0.0.1:0".into(),
            ..MeshConfig::default()
        };
        ReticulumBackend::new(cfg, true).await.unwrap()
    }

    #[tokio::test]
    async fn end_to_end_exchange() {
        let mut server = server_backend("srv").await;
        let addr = server
            .listener
            .as_ref()
            .unwrap()
            .local_addr()
            .unwrap()
            .to_string();
        let hash = server.destination_hash_hex();
        let pubkey = server.public_key_hex();

        let server_task = tokio::spawn(async move {
            let mut session = server.connect(None).await.unwrap();
            let request = server
                .receive_data(&mut session, Duration::from_secs(5))
                .await
                .unwrap()
                .expect("request expected");
            assert_eq!(request, br#"{"type":1,"count":2}"#);
            server
                .send_data(&mut session, br#"{"success":true}"#)
                .await
                .unwrap();
            server.disconnect(&mut session).await.unwrap();
            server.shutdown().await;
        });

        let cfg = MeshConfig {
            identity_path: temp_identity("cli"),
            server_hash: Some(hash),
            server_pubkey: Some(pubkey),
            server_addr: Some(addr),
            ..MeshConfig::default()
        };
        let mut client = ReticulumBackend::new(cfg, false).await.unwrap();
        let mut session = client.connect(None).await.unwrap();
        assert!(client.is_connected(&session));

        client
            .send_data(&mut session, br#"{"type":1,"count":2}"#)
            .await
            .unwrap();
        let reply = client
            .receive_data(&mut session, Duration::from_secs(5))
            .await
            .unwrap()
            .expect("reply expected");
        assert_eq!(reply, br#"{"success":true}"#);

        client.disconnect(&mut session).await.unwrap();
        assert!(!client.is_connected(&session));
        server_task.await.unwrap();

        let _ = std::fs::remove_file(temp_identity("srv"));
        let _ = std::fs::remove_file(temp_identity("cli"));
    }
}
