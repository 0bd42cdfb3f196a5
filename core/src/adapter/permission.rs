//! Permission gating between envelope routing and the modules.
//!
//! The gate is injected into the adapter (one module never imports another's
//! file); the default gate allows everything and real deployments install a
//! policy-backed one.

use std::collections::HashSet;

use uicp_protocol::Operation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionScope {
    Window,
    Dom,
    Components,
    State,
    Api,
    Compute,
    Txn,
}

impl PermissionScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionScope::Window => "window",
            PermissionScope::Dom => "dom",
            PermissionScope::Components => "components",
            PermissionScope::State => "state",
            PermissionScope::Api => "api",
            PermissionScope::Compute => "compute",
            PermissionScope::Txn => "txn",
        }
    }
}

pub fn scope_for_op(op: &Operation) -> PermissionScope {
    match op {
        Operation::WindowCreate(_)
        | Operation::WindowUpdate(_)
        | Operation::WindowMove(_)
        | Operation::WindowResize(_)
        | Operation::WindowFocus(_)
        | Operation::WindowClose(_) => PermissionScope::Window,
        Operation::DomSet(_) | Operation::DomReplace(_) | Operation::DomAppend(_) => {
            PermissionScope::Dom
        }
        Operation::ComponentRender(_)
        | Operation::ComponentUpdate(_)
        | Operation::ComponentDestroy(_) => PermissionScope::Components,
        Operation::StateSet(_)
        | Operation::StateGet(_)
        | Operation::StateWatch(_)
        | Operation::StateUnwatch(_)
        | Operation::StatePatch(_) => PermissionScope::State,
        Operation::ApiCall(_) => PermissionScope::Api,
        Operation::NeedsCode(_) => PermissionScope::Compute,
        Operation::TxnCancel(_) => PermissionScope::Txn,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Allowed,
    Denied,
}

pub trait PermissionGate: Send + Sync {
    fn check(&self, scope: PermissionScope) -> PermissionDecision;
}

pub struct AllowAllGate;

impl PermissionGate for AllowAllGate {
    fn check(&self, _scope: PermissionScope) -> PermissionDecision {
        PermissionDecision::Allowed
    }
}

/// Denies a fixed set of scopes; everything else passes.
pub struct ScopedGate {
    denied: HashSet<PermissionScope>,
}

impl ScopedGate {
    pub fn denying(scopes: impl IntoIterator<Item = PermissionScope>) -> Self {
        Self {
            denied: scopes.into_iter().collect(),
        }
    }
}

impl PermissionGate for ScopedGate {
    fn check(&self, scope: PermissionScope) -> PermissionDecision {
        if self.denied.contains(&scope) {
            PermissionDecision::Denied
        } else {
            PermissionDecision::Allowed
        }
    }
}
