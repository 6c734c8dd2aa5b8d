//! Jobs: the settings they run with, the suites they run, and the job
//! directory they leave behind.

pub mod job;
pub mod jobdata;
pub mod settings;
pub mod suite;
pub mod sysinfo;

pub use job::{exit_code, Job, JobEnv, JobError, JobOutcome};
pub use jobdata::JobData;
pub use settings::{Settings, SettingsError};
pub use suite::{SuiteStatus, TestSuite};
