use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Inactive,
    Active,
    Maintained,
    Suspended,
    Removed,
}

impl LifecycleState {
    pub fn is_published(self) -> bool {
        matches!(
            self,
            LifecycleState::Active | LifecycleState::Maintained | LifecycleState::Suspended
        )
    }

    pub fn is_terminal(self) -> bool {
        self == LifecycleState::Removed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    NavigatedAway,
    Terminated,
    GraceExpired,
}
