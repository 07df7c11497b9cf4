//! parley-services: relay and client session machinery on top of
//! `parley-core`.

pub mod broadcast;
pub mod client;
pub mod connection;
pub mod error;
pub mod framed;
pub mod registry;
pub mod server;
pub mod tls;

pub use broadcast::{relay, relay_frame, RelayReport};
pub use client::{spawn_line_reader, ChatEvent, ClientSession};
pub use connection::{ConnectionHandler, ConnectionState, HandlerSettings};
pub use error::SessionError;
pub use framed::{write_envelope, FramedReader};
pub use registry::{ConnectionId, Delivery, SessionHandle, SessionRegistry};
pub use server::RelayServer;
pub use tls::{client_config, ensure_certificate, load_server_config, AcceptAnyServerCert, TlsListener};
