pub mod connection;

pub use connection::{CloseCause, Connection, LinkHandler, WsStream, dial};
