pub mod output;
pub mod service;
pub mod types;

pub use output::{ChannelSink, EmailSender, OutputRouter};
pub use service::{SCHEDULER_CHANNEL, Scheduler};
pub use types::{JobAction, JobRun, Output, RunStatus, ScheduledJob, Trigger, next_fire};
