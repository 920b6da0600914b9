//! Access control.
//!
//! An [`AccessRule`] is an ordered list of [`AccessPredicate`]s evaluated
//! before a handler body runs. Predicates are ANDed with short-circuit: the
//! first denial wins and carries its reason. Unauthenticated callers are
//! denied with `AuthenticationRequired`, authenticated callers lacking a
//! capability with `AuthorizationDenied`; the two are never conflated.
//!
//! The role in a [`Principal`] is loaded fresh for every request, so a role
//! edit takes effect on the next call.

use std::sync::Arc;

use strata_core::{DomainError, Role, User, Versioned};

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user: Versioned<User>,
    pub role: Option<Versioned<Role>>,
}

impl Principal {
    pub fn user_id(&self) -> &str {
        &self.user.id
    }

    pub fn allows(&self, resource: &str, action: &str) -> bool {
        self.role
            .as_ref()
            .is_some_and(|role| !role.is_deleted() && role.data.allows(resource, action))
    }
}

/// Who is calling, and with which raw credential.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub principal: Option<Principal>,
    /// The credential exactly as presented, kept for token bypasses.
    pub bearer: Option<String>,
}

impl RequestContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn authenticated(principal: Principal) -> Self {
        Self {
            principal: Some(principal),
            bearer: None,
        }
    }

    /// Recorded as `initiator_id` on every version this request writes.
    pub fn initiator_id(&self) -> Option<&str> {
        self.principal.as_ref().map(Principal::user_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allow,
    Deny(DomainError),
}

/// One link of an access rule.
pub trait AccessPredicate: Send + Sync {
    fn evaluate(&self, ctx: &RequestContext) -> Decision;
}

/// Caller must be authenticated.
pub struct RequireAuthentication;

impl AccessPredicate for RequireAuthentication {
    fn evaluate(&self, ctx: &RequestContext) -> Decision {
        match ctx.principal {
            Some(_) => Decision::Allow,
            None => Decision::Deny(DomainError::AuthenticationRequired),
        }
    }
}

/// Caller's role must grant `(resource, action)`.
pub struct RequirePermission {
    pub resource: String,
    pub action: String,
}

impl AccessPredicate for RequirePermission {
    fn evaluate(&self, ctx: &RequestContext) -> Decision {
        match authorize(ctx, &self.resource, &self.action) {
            Ok(()) => Decision::Allow,
            Err(err) => Decision::Deny(err),
        }
    }
}

/// Check a single capability. Scoped checks pass the scope as the action,
/// e.g. `authorize(ctx, "playbook", "cluster_deploy")`.
pub fn authorize(ctx: &RequestContext, resource: &str, action: &str) -> Result<(), DomainError> {
    let principal = ctx
        .principal
        .as_ref()
        .ok_or(DomainError::AuthenticationRequired)?;
    if principal.allows(resource, action) {
        Ok(())
    } else {
        tracing::debug!(
            user_id = principal.user_id(),
            resource,
            action,
            "authorization denied"
        );
        Err(DomainError::AuthorizationDenied {
            resource: resource.to_string(),
            action: action.to_string(),
        })
    }
}

/// Ordered predicate chain with an optional shared-secret bypass.
#[derive(Clone, Default)]
pub struct AccessRule {
    predicates: Vec<Arc<dyn AccessPredicate>>,
    bypass_token: Option<String>,
}

impl AccessRule {
    /// A rule with no predicates allows everyone.
    pub fn open() -> Self {
        Self::default()
    }

    pub fn authenticated() -> Self {
        Self::open().with(RequireAuthentication)
    }

    pub fn with(mut self, predicate: impl AccessPredicate + 'static) -> Self {
        self.predicates.push(Arc::new(predicate));
        self
    }

    /// Append a permission requirement on the generic `api` resource.
    pub fn api(self, action: &str) -> Self {
        self.with(RequirePermission {
            resource: "api".to_string(),
            action: action.to_string(),
        })
    }

    /// A caller presenting exactly `token` skips every predicate. An empty
    /// token disables the bypass.
    pub fn or_token(mut self, token: Option<&str>) -> Self {
        self.bypass_token = token.filter(|t| !t.is_empty()).map(str::to_string);
        self
    }

    pub fn check(&self, ctx: &RequestContext) -> Result<(), DomainError> {
        if let (Some(expected), Some(presented)) = (&self.bypass_token, &ctx.bearer) {
            if expected == presented {
                return Ok(());
            }
        }
        for predicate in &self.predicates {
            if let Decision::Deny(reason) = predicate.evaluate(ctx) {
                return Err(reason);
            }
        }
        Ok(())
    }
}
