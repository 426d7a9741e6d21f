use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("Cluster coordination storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Node {node_id} already joined group {group_id}")]
    DuplicateNode { node_id: String, group_id: String },

    #[error("Failed to (de)serialize node properties: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid coordination config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, CoordinationError>;
