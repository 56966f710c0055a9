use crate::payments::error::StoreError;
use crate::payments::types::PaymentRecord;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Local view of a payment's last known state, shared with the
/// presentation layer.
///
/// Writes are whole-record replacements; the last writer wins.
#[async_trait]
pub trait PaymentRecordStore: Send + Sync {
    async fn put(&self, record: PaymentRecord) -> Result<(), StoreError>;

    async fn get(&self, charge_id: &str) -> Result<Option<PaymentRecord>, StoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryPaymentStore {
    records: Arc<RwLock<HashMap<String, PaymentRecord>>>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl PaymentRecordStore for InMemoryPaymentStore {
    async fn put(&self, record: PaymentRecord) -> Result<(), StoreError> {
        if record.charge_id.trim().is_empty() {
            return Err(StoreError::InvalidRecord(
                "charge_id cannot be empty".to_string(),
            ));
        }
        self.records
            .write()
            .await
            .insert(record.charge_id.clone(), record);
        Ok(())
    }

    async fn get(&self, charge_id: &str) -> Result<Option<PaymentRecord>, StoreError> {
        Ok(self.records.read().await.get(charge_id).cloned())
    }
}
