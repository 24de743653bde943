pub mod messages;
pub mod outbox;
pub mod server;
pub mod state;

pub use server::ProxyServer;
pub use state::{ClientId, ProxyState};
