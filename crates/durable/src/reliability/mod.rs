//! Retry policies

mod retry;

pub use retry::StepRetryPolicy;
