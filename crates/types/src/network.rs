//! Network message marker traits.
//!
//! Every wire message names its logical address through
//! [`NetworkMessage::message_type_id`]; the production bus dispatches inbound
//! frames on that address and the simulation uses it for logging.

/// A message that can travel on the cluster bus.
pub trait NetworkMessage {
    /// The logical address this message is published or sent on.
    fn message_type_id() -> &'static str;
}

/// Type-safe request/response pairing for request/reply addresses.
pub trait Request: NetworkMessage {
    type Response;
}
