//! Core traits for generic WebSocket infrastructure.

use std::fmt::Debug;

/// Wire protocol spoken over a connection.
///
/// The connection driver knows nothing about frame shapes; it asks the protocol to decode each
/// inbound text frame and to produce the heartbeat probe.
///
/// # Example
///
/// ```ignore
/// pub struct LineProtocol;
///
/// impl WireProtocol for LineProtocol {
///     type Message = String;
///
///     fn parse(&self, bytes: &[u8]) -> crate::Result<Option<String>> {
///         Ok(Some(String::from_utf8_lossy(bytes).into_owned()))
///     }
///
///     fn ping(&self) -> crate::Result<String> {
///         Ok("PING".to_owned())
///     }
///
///     fn is_pong(&self, message: &String) -> bool {
///         message == "PONG"
///     }
/// }
/// ```
pub trait WireProtocol: Send + Sync + 'static {
    /// Decoded inbound frame.
    type Message: Debug + Send;

    /// Decode one inbound text frame.
    ///
    /// `Ok(None)` means the frame carried nothing (e.g. whitespace keepalive). An error means the
    /// frame was malformed; the driver logs and drops it without closing the connection.
    fn parse(&self, bytes: &[u8]) -> crate::Result<Option<Self::Message>>;

    /// Encoded heartbeat probe.
    fn ping(&self) -> crate::Result<String>;

    /// Whether `message` acknowledges a heartbeat probe.
    fn is_pong(&self, message: &Self::Message) -> bool;
}
