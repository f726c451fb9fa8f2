//! Stable, domain-prefixed protocol error codes.
//!
//! Every failure that reaches the wire is one of these. The codes are part of
//! the protocol — clients match on them — so they never change across
//! versions, only grow.

use thiserror::Error;

/// Errors in the `directory` domain — problems with the addressed node,
/// the subscription state, or the account set.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("no such node")]
    NoSuchNode,
    #[error("node is not a subdirectory")]
    NotASubdirectory,
    #[error("node is not a note")]
    NotANote,
    #[error("subdirectory is already explored")]
    AlreadyExplored,
    #[error("exploration was not initiated")]
    NotInitiated,
    #[error("too many child elements")]
    TooManyChildren,
    #[error("too few child elements")]
    TooFewChildren,
    #[error("a node with this name exists already")]
    NodeExists,
    #[error("invalid node name: {0:?}")]
    InvalidName(String),
    #[error("note type is not known: {0:?}")]
    TypeUnknown(String),
    #[error("already subscribed to this session")]
    AlreadySubscribed,
    #[error("not subscribed to this session")]
    Unsubscribed,
    #[error("unexpected sync-in")]
    UnexpectedSyncIn,
    #[error("no such subscription request")]
    NoSuchSubscriptionRequest,
    #[error("subscription was rejected")]
    SubscriptionRejected,
    #[error("did not receive a welcome message")]
    NoWelcomeMessage,
    #[error("protocol version mismatch: server speaks {server}, client speaks {client}")]
    VersionMismatch { server: String, client: String },
    #[error("subscription method not supported")]
    MethodUnsupported,
    #[error("unexpected message: {0:?}")]
    UnexpectedMessage(String),
    #[error("no storage backend is configured")]
    NoStorage,
    #[error("chat is disabled on this server")]
    ChatDisabled,
    #[error("no such account: {0:?}")]
    NoSuchAccount(String),
    #[error("an account with this name exists already: {0:?}")]
    DuplicateAccount(String),
    #[error("invalid certificate")]
    InvalidCertificate,
    #[error("operation not supported by this server")]
    OperationUnsupported,
    #[error("the root node cannot be removed")]
    RootNodeRemoveAttempt,
    #[error("ACL was already queried for this node")]
    AclAlreadyQueried,
    #[error("ACL was not queried for this node")]
    AclNotQueried,
}

impl DirectoryError {
    /// Stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            DirectoryError::NoSuchNode => "no-such-node",
            DirectoryError::NotASubdirectory => "not-a-subdirectory",
            DirectoryError::NotANote => "not-a-note",
            DirectoryError::AlreadyExplored => "already-explored",
            DirectoryError::NotInitiated => "not-initiated",
            DirectoryError::TooManyChildren => "too-many-children",
            DirectoryError::TooFewChildren => "too-few-children",
            DirectoryError::NodeExists => "node-exists",
            DirectoryError::InvalidName(_) => "invalid-name",
            DirectoryError::TypeUnknown(_) => "type-unknown",
            DirectoryError::AlreadySubscribed => "already-subscribed",
            DirectoryError::Unsubscribed => "unsubscribed",
            DirectoryError::UnexpectedSyncIn => "unexpected-sync-in",
            DirectoryError::NoSuchSubscriptionRequest => "no-such-subscription-request",
            DirectoryError::SubscriptionRejected => "subscription-rejected",
            DirectoryError::NoWelcomeMessage => "no-welcome-message",
            DirectoryError::VersionMismatch { .. } => "version-mismatch",
            DirectoryError::MethodUnsupported => "method-unsupported",
            DirectoryError::UnexpectedMessage(_) => "unexpected-message",
            DirectoryError::NoStorage => "no-storage",
            DirectoryError::ChatDisabled => "chat-disabled",
            DirectoryError::NoSuchAccount(_) => "no-such-account",
            DirectoryError::DuplicateAccount(_) => "duplicate-account",
            DirectoryError::InvalidCertificate => "invalid-certificate",
            DirectoryError::OperationUnsupported => "operation-unsupported",
            DirectoryError::RootNodeRemoveAttempt => "root-node-remove-attempt",
            DirectoryError::AclAlreadyQueried => "acl-already-queried",
            DirectoryError::AclNotQueried => "acl-not-queried",
        }
    }
}

/// Errors in the `request` domain — problems with the request envelope
/// itself rather than with directory state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Carries the name of the permission bit that was missing, e.g.
    /// `"can-explore-node"`. The wire message text is always
    /// "Permission denied".
    #[error("Permission denied")]
    NotAuthorized { permission: &'static str },
    #[error("missing required attribute: {0:?}")]
    NoSuchAttribute(String),
    #[error("invalid seq")]
    InvalidSeq,
    #[error("reply could not be processed")]
    ReplyUnprocessed,
    #[error("unknown error domain: {0:?}")]
    UnknownDomain(String),
}

impl RequestError {
    pub fn code(&self) -> &'static str {
        match self {
            RequestError::NotAuthorized { .. } => "not-authorized",
            RequestError::NoSuchAttribute(_) => "no-such-attribute",
            RequestError::InvalidSeq => "invalid-seq",
            RequestError::ReplyUnprocessed => "reply-unprocessed",
            RequestError::UnknownDomain(_) => "unknown-domain",
        }
    }
}

/// Union of the two wire error domains.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Request(#[from] RequestError),
}

impl ProtoError {
    pub fn domain(&self) -> &'static str {
        match self {
            ProtoError::Directory(_) => "directory",
            ProtoError::Request(_) => "request",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ProtoError::Directory(e) => e.code(),
            ProtoError::Request(e) => e.code(),
        }
    }

    /// Shorthand for an authorization failure naming the missing bit.
    pub fn not_authorized(permission: &'static str) -> Self {
        ProtoError::Request(RequestError::NotAuthorized { permission })
    }
}
