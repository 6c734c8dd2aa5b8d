//! Job exit codes. Codes are bit flags and may be combined.

use std::ops::{BitOr, BitOrAssign};

#[derive(PartialEq, Eq, Debug, Clone, Copy, Default)]
pub struct ExitCode(i32);

impl ExitCode {
    /// Every test ended PASS, SKIP, CANCEL or WARN.
    pub const ALL_OK: ExitCode = ExitCode(0);
    /// Some test ended FAIL or ERROR.
    pub const TESTS_FAIL: ExitCode = ExitCode(1);
    /// The job could not be configured or set up; no tests ran.
    pub const FAIL: ExitCode = ExitCode(2);
    /// The job crashed after it started running tests.
    pub const JOB_FAIL: ExitCode = ExitCode(4);
    /// Some test ended INTERRUPTED, or the job itself was interrupted.
    pub const JOB_INTERRUPTED: ExitCode = ExitCode(8);

    pub const fn get(&self) -> i32 {
        self.0
    }

    pub const fn new(code: i32) -> Self {
        Self(code)
    }

    pub const fn contains(&self, other: ExitCode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ExitCode {
    type Output = ExitCode;

    fn bitor(self, rhs: Self) -> Self::Output {
        ExitCode(self.0 | rhs.0)
    }
}

impl BitOrAssign for ExitCode {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code.0 as u8)
    }
}
