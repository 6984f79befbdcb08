use thiserror::Error;

/// Errors surfaced at the transport boundary.
///
/// The consensus module treats any of these as "no reply": the periodic
/// replication tick and the election timeout are the retry mechanism.
#[derive(Error, Debug)]
pub enum Error {
    #[error("peer {0} is not connected")]
    PeerDisconnected(u64),

    #[error("rpc dropped in flight")]
    RpcFailed,
}

pub type Result<T> = std::result::Result<T, Error>;
