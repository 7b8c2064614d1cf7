/// Record-validation toggles, held by the caller and leased to the session.
///
/// This replaces the process-wide check-disabling flags of older alignment
/// tools with an explicit value: whoever owns the `CheckState` decides who
/// may touch it, and while a [`CheckGuard`] holds the exclusive borrow no
/// other component can read or write the toggles at all.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CheckState {
    /// Skip structural validation (sample counts, finite values, common dt).
    pub skip_structural: bool,
    /// Skip header validation (names, start times, prior corrections).
    pub skip_header: bool,
}

/// Which checks a guard should suspend for its scope.
#[derive(Clone, Copy, Debug)]
pub struct CheckSet {
    pub structural: bool,
    pub header: bool,
}

impl CheckSet {
    pub const ALL: CheckSet = CheckSet {
        structural: true,
        header: true,
    };
}

/// Scoped suspension of record checks.
///
/// `acquire` captures the prior toggle values and marks the selected checks
/// as skipped; the captured values are written back exactly once, either by
/// an explicit [`CheckGuard::release`] or by drop. A failure propagating out
/// of the guarded scope with `?` therefore restores the toggles before the
/// error reaches the caller.
pub struct CheckGuard<'a> {
    state: &'a mut CheckState,
    saved: CheckState,
    released: bool,
}

impl<'a> CheckGuard<'a> {
    pub fn acquire(state: &'a mut CheckState, suspend: CheckSet) -> Self {
        let saved = *state;
        if suspend.structural {
            state.skip_structural = true;
        }
        if suspend.header {
            state.skip_header = true;
        }
        CheckGuard {
            state,
            saved,
            released: false,
        }
    }

    /// The toggle values in effect inside the guarded scope.
    pub fn active(&self) -> &CheckState {
        self.state
    }

    /// Restore the captured toggles now instead of at drop.
    pub fn release(mut self) {
        self.restore();
    }

    fn restore(&mut self) {
        if !self.released {
            *self.state = self.saved;
            self.released = true;
        }
    }
}

impl Drop for CheckGuard<'_> {
    fn drop(&mut self) {
        self.restore();
    }
}

#[cfg(test)]
mod tests {
    use super::{CheckGuard, CheckSet, CheckState};

    #[test]
    fn release_restores_prior_values() {
        let mut state = CheckState {
            skip_structural: false,
            skip_header: true,
        };
        let guard = CheckGuard::acquire(&mut state, CheckSet::ALL);
        assert!(guard.active().skip_structural);
        assert!(guard.active().skip_header);
        guard.release();
        assert!(!state.skip_structural);
        assert!(state.skip_header);
    }

    #[test]
    fn drop_restores_on_error_path() {
        fn failing_body(state: &mut CheckState) -> Result<(), &'static str> {
            let _guard = CheckGuard::acquire(state, CheckSet::ALL);
            Err("stage failed")?;
            Ok(())
        }

        let mut state = CheckState::default();
        assert!(failing_body(&mut state).is_err());
        assert_eq!(state, CheckState::default());
    }

    #[test]
    fn partial_suspension_leaves_other_toggle_alone() {
        let mut state = CheckState::default();
        {
            let guard = CheckGuard::acquire(
                &mut state,
                CheckSet {
                    structural: true,
                    header: false,
                },
            );
            assert!(guard.active().skip_structural);
            assert!(!guard.active().skip_header);
        }
        assert_eq!(state, CheckState::default());
    }

    #[test]
    fn nested_scopes_restore_in_order() {
        let mut state = CheckState::default();
        {
            let mut inner = CheckState::default();
            let _outer = CheckGuard::acquire(&mut state, CheckSet::ALL);
            let inner_guard = CheckGuard::acquire(&mut inner, CheckSet::ALL);
            inner_guard.release();
            assert_eq!(inner, CheckState::default());
        }
        assert_eq!(state, CheckState::default());
    }
}
