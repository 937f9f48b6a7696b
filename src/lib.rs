pub mod backend;
pub mod config;
pub mod mesh;
pub mod nostr;
pub mod protocol;
pub mod session;
pub mod station;
pub mod types;
pub mod wire;

pub use backend::{create_backend, BackendError, BackendKind, BackendStatus, RadioBackend};
pub use config::{ProtocolConfig, Role, StationConfig, TncEndpoint};
pub use nostr::{NostrGateway, NoteRequest, NoteRequestType, UnconfiguredGateway};
pub use protocol::{ProtocolKind, ProtocolManager};
pub use session::{Session, SessionEngine, SessionError, SessionRegistry};
pub use station::{Station, StationError};
pub use types::{Callsign, MessageType, SessionState};
