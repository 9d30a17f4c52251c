use crate::error::{MusterError, MusterResult};
use serde::{Deserialize, Serialize};

/// A named skill at a minimum proficiency.
///
/// On an agent, `level` is what the agent offers; on a task, it is the lowest
/// level the task accepts.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    /// Capability name, e.g. `render`.
    pub kind: String,
    /// Proficiency; higher satisfies lower.
    pub level: u32,
}

impl Capability {
    /// Build a capability.
    pub fn new(kind: impl Into<String>, level: u32) -> Self {
        Self {
            kind: kind.into(),
            level,
        }
    }

    /// True if `self` (offered) covers `required`: same kind, level at least as high.
    pub fn covers(&self, required: &Capability) -> bool {
        self.kind == required.kind && self.level >= required.level
    }

    /// Reject an empty kind.
    pub fn validate(&self) -> MusterResult<()> {
        if self.kind.trim().is_empty() {
            return Err(MusterError::Validation(
                "capability kind must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.kind, self.level)
    }
}

/// True iff every capability in `required` is covered by some capability in `offered`.
pub fn satisfies_all(offered: &[Capability], required: &[Capability]) -> bool {
    required
        .iter()
        .all(|req| offered.iter().any(|cap| cap.covers(req)))
}
