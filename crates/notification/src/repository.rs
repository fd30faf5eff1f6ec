//! Persistence interface for deployment records.

use crate::error::Result;
use crate::model::DeploymentRecord;

/// Bulk storage of [`DeploymentRecord`]s.
///
/// [`crate::DeploymentStatus::flush`] is the only writer; it hands over every
/// record changed since the previous flush in one call.
pub trait StatusRepository: Send + Sync {
    /// Returns the stored records of every PDP in `pdp_group`.
    fn get_group_status(&self, pdp_group: &str) -> Result<Vec<DeploymentRecord>>;

    /// Creates, updates, and deletes records in one batch.
    fn cud(
        &self,
        created: &[DeploymentRecord],
        updated: &[DeploymentRecord],
        deleted: &[DeploymentRecord],
    ) -> Result<()>;
}
