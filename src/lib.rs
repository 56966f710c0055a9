//! Client-side PIX payment confirmation poller.
//!
//! A [`PaymentStatusPoller`] watches one PIX charge on the rental payments
//! backend until it settles, fails, expires or is stopped by its consumer.

pub mod config;
pub mod logging;
pub mod payments;
pub mod workers;

pub use config::{AppConfig, ConfigError, GatewayConfig, LoggingConfig, PollerConfig};
pub use payments::{
    ChargeRef, ChargeStatus, GatewayError, GatewayResult, InMemoryPaymentStore, PaymentGateway,
    PaymentRecord, PaymentRecordStore, PixCharge, StatusResult, StoreError,
};
pub use workers::{
    CycleOutcome, PaymentStatusPoller, PollObserver, PollPhase, PollSnapshot, StatusListener,
    StopReason, TracingObserver,
};
