use serde::{Deserialize, Serialize};

/// Which external tool a stage invokes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Scanning,
    Fixing,
    /// A second `Scanning` invocation used to confirm a fix cycle's result;
    /// kept as a distinct kind in `StageRecord` history even though it is
    /// implemented by calling the same scan adapter.
    Validating,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scanning => "scanning",
            Self::Fixing => "fixing",
            Self::Validating => "validating",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The last stage a session reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastStage {
    None,
    Scanning,
    Fixing,
    Validating,
    Done,
    Failed,
}

impl Default for LastStage {
    fn default() -> Self {
        Self::None
    }
}

/// Why a `run_full` cycle stopped.
///
/// Serializes as a plain string (`"zero_issues"`, `"budget_exhausted"`,
/// `"failed: fix"`) rather than as a tagged enum, since external callers
/// treat it as an opaque status string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TerminationReason {
    ZeroIssues,
    BudgetExhausted,
    Failed(String),
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroIssues => write!(f, "zero_issues"),
            Self::BudgetExhausted => write!(f, "budget_exhausted"),
            Self::Failed(stage) => write!(f, "failed: {stage}"),
        }
    }
}

impl Serialize for TerminationReason {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TerminationReason {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "zero_issues" => Self::ZeroIssues,
            "budget_exhausted" => Self::BudgetExhausted,
            other => match other.strip_prefix("failed: ") {
                Some(stage) => Self::Failed(stage.to_string()),
                None => Self::Failed(other.to_string()),
            },
        })
    }
}
