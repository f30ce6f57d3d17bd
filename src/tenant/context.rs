use std::future::Future;

use crate::domain::BusinessDomainId;
use crate::error::{ConnectorError, Result};

tokio::task_local! {
    static CURRENT_BUSINESS_DOMAIN: BusinessDomainId;
}

/// Ambient business domain of the unit of work running on this task.
///
/// Only the queue consumers set it. Core services take the tenant as an
/// explicit parameter.
pub struct BusinessDomainContext;

impl BusinessDomainContext {
    /// Run `work` with `tenant` as the current business domain.
    ///
    /// The value is gone once `work` finishes, whether it returned an
    /// error or panicked.
    pub async fn scope<F>(tenant: BusinessDomainId, work: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_BUSINESS_DOMAIN.scope(tenant, work).await
    }

    pub fn current() -> Option<BusinessDomainId> {
        CURRENT_BUSINESS_DOMAIN.try_with(|t| t.clone()).ok()
    }

    pub fn require() -> Result<BusinessDomainId> {
        Self::current().ok_or(ConnectorError::NoCurrentBusinessDomain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scope_sets_and_clears() {
        assert!(BusinessDomainContext::current().is_none());

        let seen = BusinessDomainContext::scope(BusinessDomainId::new("lane3"), async {
            BusinessDomainContext::require().unwrap()
        })
        .await;

        assert_eq!(seen, BusinessDomainId::new("lane3"));
        assert!(BusinessDomainContext::current().is_none());
    }

    #[tokio::test]
    async fn test_cleared_after_error() {
        let result: Result<()> = BusinessDomainContext::scope(BusinessDomainId::new("lane3"), async {
            Err(ConnectorError::Queue("boom".to_string()))
        })
        .await;

        assert!(result.is_err());
        assert!(matches!(
            BusinessDomainContext::require(),
            Err(ConnectorError::NoCurrentBusinessDomain)
        ));
    }

    #[tokio::test]
    async fn test_cleared_after_panic() {
        let handle = tokio::spawn(async {
            BusinessDomainContext::scope(BusinessDomainId::new("lane3"), async {
                panic!("unit of work failed");
            })
            .await
        });

        assert!(handle.await.is_err());
        assert!(BusinessDomainContext::current().is_none());
    }

    #[tokio::test]
    async fn test_scopes_are_per_task() {
        let a = tokio::spawn(BusinessDomainContext::scope(BusinessDomainId::new("a"), async {
            tokio::task::yield_now().await;
            BusinessDomainContext::current()
        }));
        let b = tokio::spawn(BusinessDomainContext::scope(BusinessDomainId::new("b"), async {
            tokio::task::yield_now().await;
            BusinessDomainContext::current()
        }));

        assert_eq!(a.await.unwrap(), Some(BusinessDomainId::new("a")));
        assert_eq!(b.await.unwrap(), Some(BusinessDomainId::new("b")));
    }
}
