mod client;
mod poller;

pub use client::{TimingClient, TimingSource};
pub use poller::{FailurePolicy, Poller, PollerHandle, PollerSettings};
