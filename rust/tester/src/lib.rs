#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss,
    clippy::too_many_lines
)]

//! GPU Tester
//!
//! Submits diagnostic jobs to a batch scheduler, times them out, parses what
//! every accelerator reported and classifies each one as healthy, slow, wrong,
//! broken or silent. Several runs can overlap, with staggered submissions and
//! a merged report.

pub mod classify;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod gateway;
pub mod protocol;
pub mod report;
pub mod sbatch;

pub use classify::{RunVerdicts, StatusVerdict, VerdictKind};
pub use config::TesterConfig;
pub use controller::{PollTiming, RunError, RunPaths, TestRunController};
pub use coordinator::{Coordinator, CoordinatorSettings, StaggerPolicy};
pub use gateway::{JobId, JobStatus, SchedulerGateway, SlurmGateway};
pub use protocol::{AcceleratorSlot, ResultRecord};
pub use report::{AggregateReport, ReportSummary};
