//! Security-context scoping for step callbacks.

use super::{CallContext, Capability};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;

tokio::task_local! {
    static CURRENT_PRINCIPAL: Principal;
}

/// The identity a step callback runs as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Principal identifier (user or service account).
    pub id: String,
    /// Account the principal belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

impl Principal {
    /// Creates a principal.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            account_id: None,
        }
    }

    /// Sets the account id.
    #[must_use]
    pub fn with_account_id(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }
}

/// Returns the principal of the step callback currently running on this task.
#[must_use]
pub fn current_principal() -> Option<Principal> {
    CURRENT_PRINCIPAL.try_with(Clone::clone).ok()
}

pub(crate) async fn with_principal<F: Future>(principal: Option<Principal>, fut: F) -> F::Output {
    match principal {
        Some(principal) => CURRENT_PRINCIPAL.scope(principal, fut).await,
        None => fut.await,
    }
}

/// Scopes every step callback under the principal named in the ambiance's
/// setup abstractions.
#[derive(Debug, Clone)]
pub struct SecurityContextCapability {
    principal_key: String,
    account_key: String,
}

impl Default for SecurityContextCapability {
    fn default() -> Self {
        Self {
            principal_key: "principal".to_string(),
            account_key: "accountId".to_string(),
        }
    }
}

impl SecurityContextCapability {
    /// Creates the capability with the default abstraction keys.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the setup-abstraction key holding the principal id.
    #[must_use]
    pub fn with_principal_key(mut self, key: impl Into<String>) -> Self {
        self.principal_key = key.into();
        self
    }
}

#[async_trait]
impl Capability for SecurityContextCapability {
    fn name(&self) -> &str {
        "security_context"
    }

    fn priority(&self) -> i32 {
        -100
    }

    fn principal(&self, call: &CallContext<'_>) -> Option<Principal> {
        let id = call.ambiance.setup_abstraction(&self.principal_key)?;
        let mut principal = Principal::new(id);
        if let Some(account) = call.ambiance.setup_abstraction(&self.account_key) {
            principal = principal.with_account_id(account);
        }
        Some(principal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambiance::Ambiance;
    use crate::capabilities::CapabilityChain;
    use crate::core::{StepCategory, StepType};
    use crate::steps::StepParameters;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_principal_is_scoped_to_callback() {
        let abstractions = BTreeMap::from([
            ("principal".to_string(), "alice".to_string()),
            ("accountId".to_string(), "acc-1".to_string()),
        ]);
        let ambiance = Ambiance::new("pe1", "plan1").with_setup_abstractions(abstractions);
        let params = StepParameters::default();
        let step_type = StepType::new("HTTP", StepCategory::Step);
        let call = CallContext {
            ambiance: &ambiance,
            params: &params,
            step_type: &step_type,
            callback: "execute_sync",
        };

        let chain = CapabilityChain::new().with(Arc::new(SecurityContextCapability::new()));
        let seen = chain
            .invoke(&call, async { Ok(current_principal()) })
            .await
            .unwrap();

        assert_eq!(
            seen,
            Some(Principal::new("alice").with_account_id("acc-1"))
        );
        assert!(current_principal().is_none());
    }

    #[tokio::test]
    async fn test_no_principal_without_abstraction() {
        let ambiance = Ambiance::new("pe1", "plan1");
        let params = StepParameters::default();
        let step_type = StepType::step("HTTP");
        let call = CallContext {
            ambiance: &ambiance,
            params: &params,
            step_type: &step_type,
            callback: "execute_sync",
        };

        let chain = CapabilityChain::new().with(Arc::new(SecurityContextCapability::new()));
        let seen = chain
            .invoke(&call, async { Ok(current_principal()) })
            .await
            .unwrap();
        assert!(seen.is_none());
    }
}
