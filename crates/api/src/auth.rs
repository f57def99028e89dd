//! Caller identity
//!
//! Sessions are issued and verified by the upstream gateway, which forwards
//! the caller's dojo and role as headers. These middlewares turn the headers
//! into an [`AuthUser`] request extension and gate the admin routes.

use axum::{extract::Request, middleware::Next, response::Response};
use uuid::Uuid;

use crate::error::ApiError;

pub const DOJO_ID_HEADER: &str = "x-dojo-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owner,
    Admin,
    Member,
    PlatformAdmin,
}

impl Role {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "owner" => Some(Self::Owner),
            "admin" => Some(Self::Admin),
            "member" => Some(Self::Member),
            "platform_admin" => Some(Self::PlatformAdmin),
            _ => None,
        }
    }
}

/// The authenticated caller, available to handlers as `Extension<AuthUser>`
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub dojo_id: Uuid,
    pub role: Role,
}

impl AuthUser {
    pub fn is_platform_admin(&self) -> bool {
        self.role == Role::PlatformAdmin
    }
}

/// Require a valid `x-dojo-id`; a missing role header means `member`
pub async fn require_dojo(mut request: Request, next: Next) -> Result<Response, ApiError> {
    let headers = request.headers();

    let dojo_id = headers
        .get(DOJO_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| Uuid::parse_str(s.trim()).ok())
        .ok_or(ApiError::Unauthorized)?;

    let role = match headers.get(USER_ROLE_HEADER) {
        None => Role::Member,
        Some(value) => value
            .to_str()
            .ok()
            .and_then(Role::parse)
            .ok_or(ApiError::Unauthorized)?,
    };

    request.extensions_mut().insert(AuthUser { dojo_id, role });
    Ok(next.run(request).await)
}

/// Platform admin only. Must run inside [`require_dojo`].
pub async fn require_platform_admin(request: Request, next: Next) -> Result<Response, ApiError> {
    let user = request
        .extensions()
        .get::<AuthUser>()
        .copied()
        .ok_or(ApiError::Unauthorized)?;

    if !user.is_platform_admin() {
        tracing::warn!(dojo_id = %user.dojo_id, role = ?user.role, "Admin route denied");
        return Err(ApiError::Forbidden);
    }

    Ok(next.run(request).await)
}
