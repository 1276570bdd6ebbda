pub mod router;
pub mod transform;
pub mod transport;
pub mod websocket;
