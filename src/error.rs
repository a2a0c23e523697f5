//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Agora crate error enum.
pub enum Error {
    /// The initial peer could not be resolved, or none of its resolved
    /// endpoints answered the first contact request.
    #[error("initial peer failed to respond")]
    InitialPeerFailedToRespond,

    /// A request expired before the queried peer responded.
    #[error("request timed out before the peer responded")]
    AssociationTimeout,

    /// A value lookup exhausted every candidate without finding the value.
    #[error("value not found")]
    ValueNotFound,

    /// An inbound datagram could not be decoded.
    #[error("corrupted message body: {0}")]
    CorruptedBody(&'static str),

    /// A request with the same random token is already awaiting a response.
    #[error("a request with the same token is already pending")]
    AlreadyPending,

    /// Indicates that an Id was built from a byte slice of the wrong length.
    #[error("invalid id size: {0}")]
    InvalidIdSize(usize),

    /// Indicates that an Id hex string contained a non-hex character.
    #[error("invalid hex character in id")]
    InvalidIdEncoding,

    /// The node's engine thread is no longer running.
    #[error("the node has been shut down")]
    Shutdown,

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),
}
