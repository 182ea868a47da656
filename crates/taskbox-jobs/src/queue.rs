//! Queue naming and provisioning.

use crate::error::SetupError;
use crate::store::JobStore;
use std::sync::Arc;
use taskbox_config::ConfigValidator;
use tracing::{debug, info};

/// Maximum length of a full queue name.
pub const MAX_QUEUE_NAME_LEN: usize = 100;

/// A provisioned, service-scoped queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queue {
    full_name: String,
    logical: String,
    created: bool,
}

impl Queue {
    /// `<service_name>.<logical_name>`, as stored on every job.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Name the queue was requested with.
    pub fn logical_name(&self) -> &str {
        &self.logical
    }

    /// True only for the caller that actually provisioned the queue.
    pub fn created(&self) -> bool {
        self.created
    }
}

/// Derives the full queue name, rejecting names the store cannot hold.
pub fn full_queue_name(service_name: &str, logical: &str) -> Result<String, SetupError> {
    let invalid = |reason: &str| SetupError::InvalidQueueName {
        name: logical.to_string(),
        reason: reason.to_string(),
    };

    if !ConfigValidator::is_valid_name_segment(service_name) {
        return Err(invalid("service name must be non-empty letters, digits, '_', '-' or '.'"));
    }
    // The first '.' in a full name separates service from queue.
    if !ConfigValidator::is_valid_name_segment(logical) || logical.contains('.') {
        return Err(invalid("queue name must be non-empty letters, digits, '_' or '-'"));
    }

    let full_name = format!("{}.{}", service_name, logical);
    if full_name.len() > MAX_QUEUE_NAME_LEN {
        return Err(invalid("full queue name exceeds 100 characters"));
    }
    Ok(full_name)
}

/// Ensures named queues exist in the store.
pub struct QueueManager<S: JobStore> {
    store: Arc<S>,
    service_name: String,
}

impl<S: JobStore> QueueManager<S> {
    pub fn new(store: Arc<S>, service_name: impl Into<String>) -> Self {
        Self {
            store,
            service_name: service_name.into(),
        }
    }

    /// Provisions the queue if absent. Safe under concurrent callers: the
    /// losers observe `created == false`.
    pub async fn ensure_queue(&self, logical: &str) -> Result<Queue, SetupError> {
        let full_name = full_queue_name(&self.service_name, logical)?;
        let created = self.store.ensure_queue(&full_name).await?;

        if created {
            info!(queue = %full_name, "Queue created");
        } else {
            debug!(queue = %full_name, "Queue already exists");
        }

        Ok(Queue {
            full_name,
            logical: logical.to_string(),
            created,
        })
    }
}
