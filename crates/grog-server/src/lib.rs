pub mod assets;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod keepalive;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;

pub use config::{KeepaliveConfig, ServerConfig, WindowConfig};
pub use coordinator::BroadcastCoordinator;
pub use engine::{BroadcastReport, Engine};
pub use error::SessionError;
pub use registry::SessionRegistry;
pub use server::{build_router, start, AppState, ServerHandle};
pub use session::{CloseReason, PingOutcome, Session, SessionState};
pub use shutdown::ShutdownCoordinator;
