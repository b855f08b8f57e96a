// Requester identity (already authenticated upstream)

use super::job::{OwnerId, TenantId};
use serde::{Deserialize, Serialize};

/// Elevated permissions carried by a requester
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grant {
    /// May start system-wide exports
    SystemExport,
    /// May act on jobs of any tenant (still limited to own jobs)
    AllTenants,
}

/// Who is calling: owner id, optional tenant and grants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequesterIdentity {
    pub owner_id: OwnerId,
    pub tenant_id: Option<TenantId>,
    #[serde(default)]
    pub grants: Vec<Grant>,
    /// Set for patient-launched tokens: only this patient's compartment is visible
    pub patient_context: Option<String>,
}

impl RequesterIdentity {
    pub fn new(owner_id: impl Into<OwnerId>) -> Self {
        Self {
            owner_id: owner_id.into(),
            tenant_id: None,
            grants: Vec::new(),
            patient_context: None,
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<TenantId>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_grant(mut self, grant: Grant) -> Self {
        if !self.grants.contains(&grant) {
            self.grants.push(grant);
        }
        self
    }

    pub fn with_patient_context(mut self, patient_id: impl Into<String>) -> Self {
        self.patient_context = Some(patient_id.into());
        self
    }

    pub fn has_grant(&self, grant: Grant) -> bool {
        self.grants.contains(&grant)
    }
}
