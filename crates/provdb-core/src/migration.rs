use serde::{Deserialize, Serialize};

pub const DEFAULT_GROUP_SIZE: usize = 1000;

/// Which legacy row table feeds a flattening migration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FlatRecordKind {
    Attributes,
    Extras,
}

impl FlatRecordKind {
    /// Legacy table holding one row per leaf.
    #[must_use]
    pub fn source_table(self) -> &'static str {
        match self {
            Self::Attributes => "db_dbattribute",
            Self::Extras => "db_dbextra",
        }
    }

    /// Structured column on the node table receiving the tree.
    #[must_use]
    pub fn target_column(self) -> &'static str {
        match self {
            Self::Attributes => "attributes",
            Self::Extras => "extras",
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        self.target_column()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MigrationOptions {
    pub create_columns: bool,
    pub group_size: usize,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            create_columns: false,
            group_size: DEFAULT_GROUP_SIZE,
        }
    }
}

impl MigrationOptions {
    /// Number of groups needed to cover `total_nodes`.
    #[must_use]
    pub fn total_groups(&self, total_nodes: usize) -> usize {
        total_nodes.div_ceil(self.group_size.max(1))
    }
}

/// Progress of a flattening migration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case", tag = "phase", content = "group")]
pub enum MigrationPhase {
    NotStarted,
    ColumnsEnsured,
    BatchLoop(usize),
    ErrorCheckpoint,
    Committed,
    RolledBack,
}

impl MigrationPhase {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    /// Moves to `next`. A finished migration stays finished.
    pub fn advance(&mut self, next: Self) {
        if self.is_terminal() {
            tracing::warn!(from = ?*self, to = ?next, "ignoring transition of a finished migration");
            return;
        }
        tracing::debug!(from = ?*self, to = ?next, "migration phase");
        *self = next;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationOutcome {
    Committed,
    RolledBack,
}

/// Decides whether a migration that hit conversion errors may commit.
///
/// Called once, after every group ran, only when `error_count > 0`.
pub trait ErrorCheckpoint {
    fn proceed(&mut self, error_count: usize) -> bool;
}

impl<F> ErrorCheckpoint for F
where
    F: FnMut(usize) -> bool,
{
    fn proceed(&mut self, error_count: usize) -> bool {
        self(error_count)
    }
}

/// Commits regardless of conversion errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysProceed;

impl ErrorCheckpoint for AlwaysProceed {
    fn proceed(&mut self, _error_count: usize) -> bool {
        true
    }
}

/// Rolls back on any conversion error.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverProceed;

impl ErrorCheckpoint for NeverProceed {
    fn proceed(&mut self, _error_count: usize) -> bool {
        false
    }
}
