pub mod cli;
pub mod client;
pub mod config;
pub mod memory;
pub mod protocol;
pub mod server;

pub use client::{Client, ClientError};
pub use config::{ClientConfig, ServerConfig};
pub use protocol::{Frame, Header, Packet};
pub use server::{Server, ServerError, Session, SessionId};
