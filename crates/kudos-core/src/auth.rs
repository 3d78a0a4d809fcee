//! Authorization for the admin side of the blog.
//!
//! Who may edit pages is decided once per request by a [`SessionResolver`];
//! the resulting [`AdminContext`] is then handed to every protected
//! operation. Nothing reads session state from globals.

use tracing::{debug, warn};

use crate::{KudosError, KudosResult};

/// Proof that the current request was resolved to an admin session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminContext {
    principal: String,
}

impl AdminContext {
    /// Meant to be called by [`SessionResolver`] implementations only.
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
        }
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }
}

/// Turns a bearer token into an [`AdminContext`], or refuses.
#[async_trait::async_trait]
pub trait SessionResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> KudosResult<AdminContext>;
}

/// Accepts exactly one configured token. With no token configured the admin
/// surface is closed.
pub struct StaticTokenResolver {
    token: Option<String>,
}

impl StaticTokenResolver {
    pub fn new(token: Option<String>) -> Self {
        let token = token.filter(|token| !token.trim().is_empty());
        if token.is_none() {
            warn!("No admin token configured, admin operations are disabled");
        }
        Self { token }
    }
}

#[async_trait::async_trait]
impl SessionResolver for StaticTokenResolver {
    async fn resolve(&self, token: &str) -> KudosResult<AdminContext> {
        let Some(expected) = &self.token else {
            return Err(KudosError::unauthorized("admin access is disabled").into());
        };
        if !constant_time_eq(expected.as_bytes(), token.as_bytes()) {
            debug!("Rejected admin token");
            return Err(KudosError::unauthorized("invalid admin token").into());
        }
        Ok(AdminContext::new("admin"))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
