//! Email-delivery collaborator.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{DeliveryReceipt, EmailMessage};

#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Short provider name for logs and receipts.
    fn name(&self) -> &str;

    async fn send(&self, message: &EmailMessage) -> Result<DeliveryReceipt>;
}
