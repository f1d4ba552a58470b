//! Structural self-checks for the tree and the communication stage.
//!
//! `validate_invariants` is always available and returns the first violation.
//! `debug_assert_invariants` panics on a violation, but only in debug builds
//! or with the `strict-invariants` / `check-invariants` features.

use crate::cascade_error::CascadeError;

pub trait DebugInvariants {
    fn debug_assert_invariants(&self);
    fn validate_invariants(&self) -> Result<(), CascadeError>;
}

/// `Ok(())` if `cond` holds, otherwise an invariant violation described by
/// `msg`.
#[inline]
pub fn ensure(cond: bool, msg: impl FnOnce() -> String) -> Result<(), CascadeError> {
    if cond {
        Ok(())
    } else {
        Err(CascadeError::InvariantViolation(msg()))
    }
}

/// Panic with `$what` in the message if `$expr` is an error, when invariant
/// checking is compiled in.
#[macro_export]
macro_rules! debug_invariants {
    ($expr:expr, $what:expr) => {
        #[cfg(any(debug_assertions, feature = "strict-invariants", feature = "check-invariants"))]
        if let Err(e) = $expr {
            log::error!("{} invariants broken: {}", $what, e);
            panic!("[invariants] {}: {}", $what, e);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_reports_message_only_on_failure() {
        assert!(ensure(true, || unreachable!()).is_ok());
        match ensure(false, || "broken".to_string()) {
            Err(CascadeError::InvariantViolation(m)) => assert_eq!(m, "broken"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
