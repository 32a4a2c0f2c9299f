//! The destination for a job's messages.
//!
//! A respondable is either a live command interaction or a plain message the
//! bot edits in place. The platform layer picks the implementation when it
//! submits the job; the bridge only sees this trait.

use async_trait::async_trait;
use buddy_core::types::UserId;

use crate::error::DeliveryError;
use crate::types::Payload;

#[async_trait]
pub trait Respondable: Send + Sync {
    /// The user who started the job.
    fn user(&self) -> &UserId;

    /// Acknowledge the command before the job starts.
    async fn defer(&self) -> Result<(), DeliveryError>;

    /// Replace the current message content.
    async fn edit(&self, payload: Payload) -> Result<(), DeliveryError>;

    /// Remove any interactive controls (overwrite buttons) from the message.
    async fn clear_prompt(&self) -> Result<(), DeliveryError>;

    /// Delete the progress message, or blank it where deletion is impossible.
    async fn delete_or_replace(&self) -> Result<(), DeliveryError>;

    /// Post the final, standalone result message.
    async fn send_final(&self, payload: Payload) -> Result<(), DeliveryError>;
}
