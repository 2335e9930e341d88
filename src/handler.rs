use async_trait::async_trait;

use crate::client::Message;
use crate::error::ProcessingError;

/// Trait for implementing message handling logic
///
/// Implementors hold the business logic for a single message and indicate
/// success/failure through the return type. A handler is invoked for one
/// partition at a time and never concurrently for two messages of the same
/// partition.
///
/// # Examples
///
/// ```rust
/// use partitioned_consumer::{Handler, Message, ProcessingError};
///
/// struct BalanceRecalculation;
///
/// #[async_trait::async_trait]
/// impl Handler for BalanceRecalculation {
///     async fn handle(&self, message: &Message) -> Result<(), ProcessingError> {
///         match message.payload.as_deref() {
///             Some(_) => Ok(()),
///             None => Err(ProcessingError::hard(anyhow::anyhow!("empty payload"))),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync {
    /// Process a single message
    ///
    /// # Returns
    ///
    /// * `Ok(())` if processing succeeded
    /// * `Err(ProcessingError::SoftFailure)` for retriable errors
    /// * `Err(ProcessingError::HardFailure)` for permanent failures
    async fn handle(&self, message: &Message) -> Result<(), ProcessingError>;

    /// Business event name used to label metrics and spans
    fn extract_event_name(&self, _message: &Message) -> Option<String> {
        None
    }
}
