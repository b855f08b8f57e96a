// Access Control Gate
// Decides whether a requester may start, query or stop an export job

use crate::domain::{ExportJob, ExportScope, Grant, RequesterIdentity};
use crate::error::{ExportError, Result};
use tracing::debug;

/// Operation being authorized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    Status,
    Stop,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Start => f.write_str("start"),
            Operation::Status => f.write_str("status"),
            Operation::Stop => f.write_str("stop"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    Forbidden(String),
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allowed)
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            AccessDecision::Allowed => Ok(()),
            AccessDecision::Forbidden(reason) => Err(ExportError::Forbidden(reason)),
        }
    }
}

/// Owner, tenant and scope checks
#[derive(Debug, Clone)]
pub struct AccessGate {
    multi_tenancy: bool,
}

impl AccessGate {
    pub fn new(enable_multi_tenancy: bool) -> Self {
        Self {
            multi_tenancy: enable_multi_tenancy,
        }
    }

    /// Authorize `operation` on `job`
    ///
    /// For `Start`, `job` is the not-yet-persisted candidate built from the request.
    pub fn authorize(
        &self,
        requester: &RequesterIdentity,
        job: &ExportJob,
        operation: Operation,
    ) -> AccessDecision {
        let decision = match operation {
            Operation::Start => self.authorize_start(requester, job),
            Operation::Status | Operation::Stop => self.authorize_existing(requester, job),
        };

        if let AccessDecision::Forbidden(reason) = &decision {
            debug!(
                job_id = %job.job_id,
                owner_id = %requester.owner_id,
                operation = %operation,
                reason = %reason,
                "Access denied"
            );
        }
        decision
    }

    fn authorize_start(&self, requester: &RequesterIdentity, job: &ExportJob) -> AccessDecision {
        if self.multi_tenancy && requester.tenant_id.is_none() {
            return AccessDecision::Forbidden("requester has no tenant".to_string());
        }

        // Patient-launched tokens only see their own compartment
        if let Some(context) = &requester.patient_context {
            return match &job.request.scope {
                ExportScope::Patient {
                    patient_id: Some(id),
                } if id == context => AccessDecision::Allowed,
                scope => AccessDecision::Forbidden(format!(
                    "scope {} is outside patient context Patient/{}",
                    scope, context
                )),
            };
        }

        if job.request.scope.is_system() && !requester.has_grant(Grant::SystemExport) {
            return AccessDecision::Forbidden(
                "system-wide export requires the system export grant".to_string(),
            );
        }

        AccessDecision::Allowed
    }

    fn authorize_existing(&self, requester: &RequesterIdentity, job: &ExportJob) -> AccessDecision {
        if requester.owner_id != job.owner_id {
            return AccessDecision::Forbidden(format!(
                "job {} belongs to another requester",
                job.job_id
            ));
        }

        if self.multi_tenancy
            && requester.tenant_id != job.tenant_id
            && !requester.has_grant(Grant::AllTenants)
        {
            return AccessDecision::Forbidden(format!(
                "job {} belongs to another tenant",
                job.job_id
            ));
        }

        AccessDecision::Allowed
    }
}
