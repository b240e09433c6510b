//! Tracking of server-side jobs.
//!
//! # Architecture
//!
//! ```text
//! submit (DeckApi)                     caller
//!      │                                  │
//!      ▼                                  ▼
//!   JobRef ───────► TaskPoller::start ──► PollHandle
//!                         │                   │ stop() / scope cancel
//!                         ▼                   ▼
//!               tick every interval     outcome().await
//!                         │
//!                         ▼
//!               DeckApi::job_status ──► on_update(snapshot)
//!                         │
//!          terminal / timeout / query error / cancel
//!                         │
//!                         ▼
//!                    PollOutcome
//! ```
//!
//! Each poller owns one job id and nothing else, so any number of them can
//! run side by side. `ActiveJobs` is the set of jobs a view is still waiting
//! on; it drops a job as soon as its poller finishes.

mod active;
mod poller;

pub use active::ActiveJobs;
pub use poller::{PollConfig, PollHandle, PollOutcome, TaskPoller};
