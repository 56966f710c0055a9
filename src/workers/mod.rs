pub mod status_poller;

pub use status_poller::{
    backoff_interval, interval_for_status, CycleOutcome, NoopListener, PaymentStatusPoller,
    PaymentStatusPollerBuilder, PollObserver, PollPhase, PollSnapshot, SkipReason, StatusListener,
    StopReason, TracingObserver,
};
