//! CacheReleaser port

use crate::domain::{JobId, Owner};
use crate::error::FerryError;

/// Releases cache entries a job holds once it stops needing them.
pub trait CacheReleaser: Send + Sync {
    fn release(&self, job_id: &JobId, owner: &Owner) -> Result<(), FerryError>;
}

/// For setups without a cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl CacheReleaser for NoCache {
    fn release(&self, _job_id: &JobId, _owner: &Owner) -> Result<(), FerryError> {
        Ok(())
    }
}
