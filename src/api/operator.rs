use std::convert::Infallible;

use axum::{extract::FromRequestParts, http::request::Parts};

pub const ROLE_HEADER: &str = "x-operator-role";
pub const NAME_HEADER: &str = "x-operator";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Operator,
}

/// Caller identity as asserted by request headers. Missing or unknown roles
/// fall back to `Operator`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub name: String,
    pub role: Role,
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let role = match header(ROLE_HEADER) {
            Some(r) if r.eq_ignore_ascii_case("admin") => Role::Admin,
            _ => Role::Operator,
        };
        let name = header(NAME_HEADER).unwrap_or("operator").to_owned();

        Ok(Self { name, role })
    }
}
