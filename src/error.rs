use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("stream connection failed: {0}")]
    Connection(String),

    #[error("partition {partition} read failed: {reason}")]
    StreamRead { partition: String, reason: String },

    #[error("undecodable telemetry payload: {0}")]
    Decode(String),

    #[error("hub service call failed: {0}")]
    RemoteCall(String),

    #[error("all {0} partition readers terminated with errors")]
    AllReadersFailed(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
