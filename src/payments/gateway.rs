use crate::payments::error::GatewayResult;
use crate::payments::types::{ChargeRef, StatusResult};
use async_trait::async_trait;

/// Status lookups exposed by the payments backend.
///
/// Implementations return every failure as a [`GatewayError`] value; the
/// poller relies on never seeing a panic cross this boundary.
///
/// [`GatewayError`]: crate::payments::error::GatewayError
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn check_status_by_internal_id(&self, id: &str) -> GatewayResult<StatusResult>;

    async fn check_status_by_external_id(&self, id: &str) -> GatewayResult<StatusResult>;

    fn name(&self) -> &'static str;
}

/// Routes a charge reference to the matching lookup. There is no fallback
/// between the two namespaces.
pub async fn check_status(
    gateway: &dyn PaymentGateway,
    charge_ref: &ChargeRef,
) -> GatewayResult<StatusResult> {
    match charge_ref {
        ChargeRef::Internal(id) => gateway.check_status_by_internal_id(id).await,
        ChargeRef::External(id) => gateway.check_status_by_external_id(id).await,
    }
}
