use std::fmt;
use std::str::FromStr;

use crate::error::GridError;
use crate::models::ClusterStateKind;

/// The activation state of the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClusterState {
    /// No partition data may be read or written.
    Inactive,
    /// Partition data may be read and written.
    Active,
    /// Partition data may only be read.
    ActiveReadOnly,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::Inactive
    }
}

impl ClusterState {
    /// Check if partition reads are permitted in this state.
    pub fn permits_read(self) -> bool {
        matches!(self, Self::Active | Self::ActiveReadOnly)
    }

    /// Check if partition writes are permitted in this state.
    pub fn permits_write(self) -> bool {
        matches!(self, Self::Active)
    }

    /// Check if this is one of the active states.
    pub fn is_active(self) -> bool {
        self.permits_read()
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => write!(f, "INACTIVE"),
            Self::Active => write!(f, "ACTIVE"),
            Self::ActiveReadOnly => write!(f, "ACTIVE_READ_ONLY"),
        }
    }
}

impl FromStr for ClusterState {
    type Err = GridError;

    fn from_str(val: &str) -> Result<Self, Self::Err> {
        match val.trim().to_ascii_uppercase().as_str() {
            "INACTIVE" => Ok(Self::Inactive),
            "ACTIVE" => Ok(Self::Active),
            "ACTIVE_READ_ONLY" => Ok(Self::ActiveReadOnly),
            other => Err(GridError::InvalidInput(format!("unknown cluster state {}", other))),
        }
    }
}

impl From<ClusterStateKind> for ClusterState {
    fn from(kind: ClusterStateKind) -> Self {
        match kind {
            ClusterStateKind::Inactive => Self::Inactive,
            ClusterStateKind::Active => Self::Active,
            ClusterStateKind::ActiveReadOnly => Self::ActiveReadOnly,
        }
    }
}

impl From<ClusterState> for ClusterStateKind {
    fn from(state: ClusterState) -> Self {
        match state {
            ClusterState::Inactive => Self::Inactive,
            ClusterState::Active => Self::Active,
            ClusterState::ActiveReadOnly => Self::ActiveReadOnly,
        }
    }
}
