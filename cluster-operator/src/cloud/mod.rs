//! Cloud bootstrap & cleanup (C8).
//!
//! A line-for-line idiomatic port of
//! `original_source/api/pkg/provider/cloud/openstack/provider.go`'s
//! `InitializeCloudProvider`/`CleanUpCloudProvider`. The actual OpenStack REST calls
//! (list/create network, subnet, router, security group) are an opaque collaborator
//! per scope, so they sit behind [`openstack::OpenstackApi`]: a `reqwest`-backed
//! production impl for real deployments, and a deterministic in-memory fake for
//! tests — the same trait-for-testability split the teacher repo uses for its own
//! external-collaborator seams.

pub mod openstack;

use std::fmt;

/// Errors surfaced by the opaque cloud collaborator. `NotFound` is distinguished
/// because cleanup swallows it (the resource is already gone); everything else
/// propagates as [`crate::error::Error::Cloud`].
#[derive(Debug, Clone)]
pub enum CloudError {
    NotFound,
    Other(String),
}

impl fmt::Display for CloudError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudError::NotFound => write!(f, "not found"),
            CloudError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl From<CloudError> for crate::error::Error {
    fn from(e: CloudError) -> Self {
        crate::error::Error::Cloud(e.to_string())
    }
}

pub type CloudResult<T> = std::result::Result<T, CloudError>;

/// Not-found errors on delete are swallowed: the resource is already gone.
pub(crate) fn swallow_not_found(res: CloudResult<()>) -> CloudResult<()> {
    match res {
        Err(CloudError::NotFound) => Ok(()),
        other => other,
    }
}
