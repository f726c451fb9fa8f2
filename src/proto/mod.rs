//! Wire protocol: element schema, error domains, shared id types.

pub mod error;
pub mod message;

pub use error::{DirectoryError, ProtoError, RequestError};
pub use message::{
    Message, NodeSheet, SessionFrame, SubscribeChild, SyncInChild, WireAccount,
};

/// Process-unique node id. The root node is id 0; 0 doubles as the "no node"
/// sentinel in parent references and subreq targets.
pub type NodeId = u64;

/// Server-assigned connection sequence id, announced in `welcome`.
pub type ConnId = u32;

/// Client-chosen request sequence number, echoed on every response.
pub type Seq = u32;

/// Directory protocol version, `major.minor`. Clients with a different
/// major are turned away.
pub const PROTOCOL_VERSION: &str = "1.0";

/// The only subscription transport method this server offers: all group
/// traffic is relayed through the central server connection.
pub const METHOD_CENTRAL: &str = "central";

/// Group name of the server-wide chat.
pub const CHAT_GROUP: &str = "chat";

/// Stable subscription group name for a note's session.
pub fn session_group_name(node: NodeId) -> String {
    format!("session/{node}")
}

/// Globally unique request tag: the connection's server-assigned id
/// concatenated with the client's seq. Used in logs and nowhere else.
pub fn request_tag(conn: ConnId, seq: Option<Seq>) -> String {
    match seq {
        Some(seq) => format!("{conn}/{seq}"),
        None => format!("{conn}/-"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_group_names_are_stable() {
        assert_eq!(session_group_name(17), "session/17");
        assert_eq!(session_group_name(17), session_group_name(17));
    }

    #[test]
    fn test_request_tag_concatenates_conn_and_seq() {
        assert_eq!(request_tag(12, Some(7)), "12/7");
        assert_eq!(request_tag(12, None), "12/-");
    }
}
