//! Microphone permission capability.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionStatus {
    Granted,
    /// Not granted (yet). `request()` may still prompt.
    Denied,
    /// No microphone or no permission system to ask.
    Unavailable,
}

/// Host permission query/request. `request()` may suspend while the user
/// answers a prompt.
#[async_trait]
pub trait PermissionProvider: Send + Sync {
    async fn query(&self) -> PermissionStatus;

    async fn request(&self) -> PermissionStatus;
}

/// Fixed answers, for hosts without a prompt (desktop) and for tests.
pub struct StaticPermissions {
    query: PermissionStatus,
    request: PermissionStatus,
    requests: AtomicUsize,
}

impl StaticPermissions {
    pub fn new(query: PermissionStatus, request: PermissionStatus) -> Self {
        Self {
            query,
            request,
            requests: AtomicUsize::new(0),
        }
    }

    pub fn granted() -> Self {
        Self::new(PermissionStatus::Granted, PermissionStatus::Granted)
    }

    /// Not yet granted; the prompt grants it.
    pub fn prompt_grants() -> Self {
        Self::new(PermissionStatus::Denied, PermissionStatus::Granted)
    }

    pub fn denied() -> Self {
        Self::new(PermissionStatus::Denied, PermissionStatus::Denied)
    }

    pub fn unavailable() -> Self {
        Self::new(PermissionStatus::Unavailable, PermissionStatus::Unavailable)
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermissionProvider for StaticPermissions {
    async fn query(&self) -> PermissionStatus {
        self.query
    }

    async fn request(&self) -> PermissionStatus {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.request
    }
}
