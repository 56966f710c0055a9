//! PIX charge model and the collaborators the status poller talks to.

pub mod error;
pub mod gateway;
#[cfg(feature = "http")]
pub mod http;
pub mod store;
pub mod types;

pub use error::{GatewayError, GatewayResult, StoreError};
pub use gateway::{check_status, PaymentGateway};
#[cfg(feature = "http")]
pub use http::HttpPaymentGateway;
pub use store::{InMemoryPaymentStore, PaymentRecordStore};
pub use types::{ChargeRef, ChargeStatus, PaymentRecord, PixCharge, StatusResult};
