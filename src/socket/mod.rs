pub mod consts;
mod websocket;

pub use websocket::{TokioWebSocketTransport, TokioWebSocketTransportFactory};
