pub mod enqueuer;
pub mod feed;
pub mod job;

pub use enqueuer::{Enqueuer, PollSummary};
pub use feed::SourceFeed;
pub use job::{JobKey, JobStatus, QueuedJob};
