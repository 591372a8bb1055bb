use kith_types::EntityId;

/// Errors of the Me subsystem.
#[derive(Debug, thiserror::Error)]
pub enum MeError {
    /// A private key was configured both as a file and as hex.
    #[error("private key given both as file and hex")]
    InvalidPrivateKeyFileHex,

    #[error("invalid me: {0}")]
    InvalidMe(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// The peer may not touch this entity, or the entity is unknown.
    #[error("invalid entity: {0}")]
    InvalidEntity(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("node is already a device of this identity")]
    AlreadyMyNode,

    #[error("invalid node: {0}")]
    InvalidNode(String),

    #[error("invalid raft entry: {0}")]
    InvalidEntry(String),

    #[error("invalid raft index: {index} (applied {applied})")]
    InvalidRaftIndex { index: u64, applied: u64 },

    #[error("unable to become raft leader")]
    UnableToBeLead,

    #[error("a raft leader is known: {0}")]
    WithLead(u64),

    #[error("raft is not running for {0}")]
    RaftStopped(EntityId),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("service error: {0}")]
    Service(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("database error: {0}")]
    Db(#[from] kith_db::DbError),

    #[error("raft error: {0}")]
    Raft(kith_raft::RaftError),

    #[error("raft storage error: {0}")]
    Storage(#[from] kith_raft::StorageError),

    #[error("oplog error: {0}")]
    Oplog(#[from] kith_oplog::OplogError),

    #[error("crypto error: {0}")]
    Crypto(#[from] kith_crypto::CryptoError),

    #[error("join error: {0}")]
    Join(kith_join::JoinError),

    #[error("transport error: {0}")]
    Transport(#[from] kith_transport::TransportError),

    #[error("type error: {0}")]
    Types(#[from] kith_types::TypeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<kith_raft::RaftError> for MeError {
    fn from(e: kith_raft::RaftError) -> Self {
        match e {
            kith_raft::RaftError::WithLead(lead) => MeError::WithLead(lead),
            kith_raft::RaftError::Store(e) => MeError::Storage(e),
            other => MeError::Raft(other),
        }
    }
}

impl From<kith_join::JoinError> for MeError {
    fn from(e: kith_join::JoinError) -> Self {
        match e {
            kith_join::JoinError::AlreadyExists => MeError::AlreadyExists("join request".into()),
            kith_join::JoinError::NotFound => MeError::NotFound("join request".into()),
            other => MeError::Join(other),
        }
    }
}

impl From<serde_json::Error> for MeError {
    fn from(e: serde_json::Error) -> Self {
        MeError::Serialization(e.to_string())
    }
}

impl MeError {
    /// Errors after which the backend cannot keep running.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MeError::Db(kith_db::DbError::Sqlite(_) | kith_db::DbError::Migration(_))
                | MeError::Raft(kith_raft::RaftError::Corrupted(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, MeError>;
