use crate::registry::HubPhase;

/// Maximum stderr tail carried in user-visible failure messages.
pub const STDERR_TAIL_LIMIT: usize = 2048;

/// Hub-wide error taxonomy with stable machine codes.
///
/// Every variant maps to exactly one wire `code` (see [`HubError::code`]);
/// the HTTP layer serialises `{ok: false, error, code, diagnostics?}` from
/// these and never leaks backtraces.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Another live drone already uses the requested name.
    #[error("drone name already in use: {name}")]
    NameConflict {
        /// The conflicting display name.
        name: String,
    },

    /// The name failed validation (length, newlines, charset).
    #[error("invalid drone name: {reason}")]
    InvalidName {
        /// Why validation rejected the name.
        reason: String,
    },

    /// The referenced drone, chat, prompt, or PR does not exist.
    #[error("{what} not found")]
    NotFound {
        /// Human description of the missing entity.
        what: String,
    },

    /// The operation is not legal in the drone's current phase.
    #[error("cannot {action} while drone is {phase}")]
    StateViolation {
        /// The rejected action, e.g. "rename".
        action: String,
        /// The phase the drone was in.
        phase: HubPhase,
    },

    /// A container engine operation exited non-zero.
    #[error("container engine failure: {message}")]
    EngineFailure {
        /// Combined stderr/stdout tail from the engine.
        message: String,
    },

    /// A blocking call exceeded its deadline.
    #[error("{action} timed out after {seconds}s")]
    Timeout {
        /// The operation that was cut off.
        action: String,
        /// The deadline that elapsed.
        seconds: u64,
    },

    /// After seeding, the drone HEAD did not match the host commit.
    #[error("seed mismatch: drone HEAD {drone_head} != host {host_head}")]
    SeedMismatch {
        /// HEAD observed inside the drone after seeding.
        drone_head: String,
        /// The host commit the seed was taken from.
        host_head: String,
    },

    /// The non-committing merge hit conflicts; the conflicted state is left
    /// in place on the host for inspection.
    #[error("merge produced conflicts in {} file(s)", conflict_files.len())]
    PatchApplyConflict {
        /// Paths reported by `git diff --name-only --diff-filter=U`.
        conflict_files: Vec<String>,
    },

    /// The merge failed for a reason other than conflicts and was aborted.
    #[error("failed to apply drone changes: {message}")]
    PatchApplyError {
        /// git's diagnostics.
        message: String,
    },

    /// PR merge refused: the PR has merge conflicts.
    #[error("pull request #{number} has merge conflicts")]
    BlockedConflict {
        /// The PR number.
        number: u64,
    },

    /// PR merge refused by policy (draft, changes requested, checks not
    /// green without `force`).
    #[error("pull request #{number} blocked: {reason}")]
    BlockedPolicy {
        /// The PR number.
        number: u64,
        /// Which gate refused the merge.
        reason: String,
    },

    /// The hosting service rejected our credentials.
    #[error("authentication with the hosting service failed")]
    AuthFailure,

    /// The hosting service answered with a non-2xx status.
    #[error("hosting service returned HTTP {status}")]
    UpstreamHttp {
        /// The upstream status code.
        status: u16,
        /// Response body tail for diagnostics.
        body: String,
    },

    /// Anything else; details stay in the logs.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HubError {
    /// The stable machine code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NameConflict { .. } => "name_conflict",
            Self::InvalidName { .. } => "invalid_name",
            Self::NotFound { .. } => "not_found",
            Self::StateViolation { .. } => "state_violation",
            Self::EngineFailure { .. } => "engine_failure",
            Self::Timeout { .. } => "timeout",
            Self::SeedMismatch { .. } => "seed_mismatch",
            Self::PatchApplyConflict { .. } => "patch_apply_conflict",
            Self::PatchApplyError { .. } => "patch_apply_error",
            Self::BlockedConflict { .. } => "blocked_conflict",
            Self::BlockedPolicy { .. } => "blocked_policy",
            Self::AuthFailure => "auth_failure",
            Self::UpstreamHttp { .. } => "upstream_http",
            Self::Internal(_) => "internal",
        }
    }

    /// Build an `engine_failure` from combined process output, keeping only
    /// the last [`STDERR_TAIL_LIMIT`] bytes.
    #[must_use]
    pub fn engine_failure(stderr: &str, stdout: &str) -> Self {
        let mut message = String::new();
        if !stderr.trim().is_empty() {
            message.push_str(stderr.trim());
        }
        if !stdout.trim().is_empty() {
            if !message.is_empty() {
                message.push('\n');
            }
            message.push_str(stdout.trim());
        }
        Self::EngineFailure {
            message: tail(&message, STDERR_TAIL_LIMIT),
        }
    }

    /// Convenience constructor for [`HubError::NotFound`].
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }
}

/// Shorthand result alias used throughout the hub.
pub type HubResult<T> = Result<T, HubError>;

/// Last `limit` bytes of `s`, respecting char boundaries.
fn tail(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_owned();
    }
    let mut start = s.len() - limit;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            HubError::NameConflict {
                name: "a".to_owned()
            }
            .code(),
            "name_conflict"
        );
        assert_eq!(
            HubError::PatchApplyConflict {
                conflict_files: vec!["README.md".to_owned()]
            }
            .code(),
            "patch_apply_conflict"
        );
        assert_eq!(HubError::AuthFailure.code(), "auth_failure");
        assert_eq!(
            HubError::Internal(anyhow::anyhow!("boom")).code(),
            "internal"
        );
    }

    #[test]
    fn engine_failure_combines_streams() {
        let err = HubError::engine_failure("bad thing\n", "context line\n");
        match err {
            HubError::EngineFailure { message } => {
                assert!(message.contains("bad thing"), "stderr kept: {message}");
                assert!(message.contains("context line"), "stdout kept: {message}");
            }
            other => panic!("expected EngineFailure, got {other:?}"),
        }
    }

    #[test]
    fn engine_failure_trims_to_tail() {
        let long = "x".repeat(STDERR_TAIL_LIMIT * 2);
        let err = HubError::engine_failure(&long, "");
        match err {
            HubError::EngineFailure { message } => {
                assert_eq!(message.len(), STDERR_TAIL_LIMIT);
            }
            other => panic!("expected EngineFailure, got {other:?}"),
        }
    }

    #[test]
    fn tail_respects_char_boundaries() {
        let s = "ééééé";
        let t = tail(s, 3);
        assert!(t.chars().all(|c| c == 'é'));
    }
}
