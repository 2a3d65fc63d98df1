//! Tenant discovery.

use std::collections::HashSet;
use std::sync::Arc;

use futures::{stream, StreamExt, TryStreamExt};
use object_store::ObjectStore;
use tracing::warn;

use crate::bucket::TenantBucket;
use crate::error::{BlockwardenError, Error};
use crate::markers::TENANT_DELETION_MARK_PATH;

const DELETION_MARK_CHECK_CONCURRENCY: usize = 16;

/// Applies the `enabled_tenants` and `disabled_tenants` settings. An empty
/// enabled list allows every tenant that is not disabled.
#[derive(Debug, Clone, Default)]
pub struct AllowedTenants {
    enabled: HashSet<String>,
    disabled: HashSet<String>,
}

impl AllowedTenants {
    pub fn new(enabled: &[String], disabled: &[String]) -> Self {
        Self {
            enabled: enabled.iter().cloned().collect(),
            disabled: disabled.iter().cloned().collect(),
        }
    }

    pub fn is_allowed(&self, tenant: &str) -> bool {
        if !self.enabled.is_empty() && !self.enabled.contains(tenant) {
            return false;
        }
        !self.disabled.contains(tenant)
    }
}

pub type OwnershipFn = Arc<dyn Fn(&str) -> Result<bool, Error> + Send + Sync>;

/// Tenants found in the bucket and owned by this instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScannedTenants {
    pub active: Vec<String>,
    /// Tenants carrying a tenant deletion mark.
    pub deleted: Vec<String>,
}

pub struct TenantsScanner {
    store: Arc<dyn ObjectStore>,
    is_owned: OwnershipFn,
}

impl TenantsScanner {
    pub fn new(store: Arc<dyn ObjectStore>, is_owned: OwnershipFn) -> Self {
        Self { store, is_owned }
    }

    /// Lists the tenants of the bucket owned by this instance. A tenant whose
    /// ownership cannot be determined is skipped for this scan.
    pub async fn scan_tenants(&self) -> Result<ScannedTenants, Error> {
        Ok(self.scan().await?)
    }

    pub(crate) async fn scan(&self) -> Result<ScannedTenants, BlockwardenError> {
        let listing = self.store.list_with_delimiter(None).await?;
        let mut owned = Vec::new();
        for prefix in listing.common_prefixes {
            let Some(tenant) = prefix.filename() else {
                continue;
            };
            match (self.is_owned)(tenant) {
                Ok(true) => owned.push(tenant.to_string()),
                Ok(false) => {}
                Err(e) => warn!(
                    tenant,
                    error = %e,
                    "unable to check if tenant is owned by this instance"
                ),
            }
        }

        let flagged: Vec<(String, bool)> = stream::iter(owned)
            .map(|tenant| async move {
                let bucket = TenantBucket::new(self.store.clone(), &tenant);
                let deleted = bucket.exists(TENANT_DELETION_MARK_PATH).await?;
                Ok::<_, BlockwardenError>((tenant, deleted))
            })
            .buffered(DELETION_MARK_CHECK_CONCURRENCY)
            .try_collect()
            .await?;

        let mut scanned = ScannedTenants::default();
        for (tenant, deleted) in flagged {
            if deleted {
                scanned.deleted.push(tenant);
            } else {
                scanned.active.push(tenant);
            }
        }
        Ok(scanned)
    }
}
