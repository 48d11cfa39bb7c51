//! Step modes and the assertion severity they select.
use serde::Serialize;

use crate::step::{Asserts, StepCtx};

/// Tag carried by a [`StepCtx`] that decides how failures are escalated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, strum::Display)]
pub enum StepMode {
    /// First failure aborts the step.
    #[default]
    Sync,
    /// Poll until expectations hold. Failures are recorded, not fatal.
    Async,
    /// Teardown. Failures are recorded so sibling cleanups still run.
    Cleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
pub enum AssertionMode {
    Require,
    Assert,
}

/// Mode advertised by the step, [`StepMode::Sync`] when none was set.
pub fn get_step_mode(step: &StepCtx) -> StepMode {
    step.mode().unwrap_or_default()
}

pub fn assertion_mode_for(mode: StepMode) -> AssertionMode {
    match mode {
        StepMode::Sync => AssertionMode::Require,
        StepMode::Async | StepMode::Cleanup => AssertionMode::Assert,
    }
}

pub fn pick_asserter(step: &StepCtx, mode: AssertionMode) -> Asserts {
    match mode {
        AssertionMode::Require => step.require(),
        AssertionMode::Assert => step.assert(),
    }
}
