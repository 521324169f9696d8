use axum::{extract::FromRequestParts, http::request::Parts};
use std::convert::Infallible;

/// Tenant identity trusted from a request header. Authentication is out of scope; the header
/// value is taken as-is.
pub struct TenantId(pub String);

impl<S> FromRequestParts<S> for TenantId
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let tenant = parts
            .headers
            .get("x-tenant-id")
            .or_else(|| parts.headers.get("x-user-id"))
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .unwrap_or("default")
            .to_string();
        Ok(TenantId(tenant))
    }
}

/// Opaque replay-protection key. Falls back to a fresh UUID, which is equivalent to no
/// replay protection for that single request.
pub struct IdempotencyKey(pub String);

impl<S> FromRequestParts<S> for IdempotencyKey
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let key = parts
            .headers
            .get("idempotency-key")
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty() && s.len() <= 255)
            .map(|s| s.to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Ok(IdempotencyKey(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[tokio::test]
    async fn defaults_to_default_tenant() {
        let req = Request::builder().body(()).unwrap();
        let (mut parts, _) = req.into_parts();
        let TenantId(tenant) = TenantId::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(tenant, "default");
    }

    #[tokio::test]
    async fn prefers_x_tenant_id_over_x_user_id() {
        let req = Request::builder()
            .header("x-tenant-id", "acme")
            .header("x-user-id", "someone")
            .body(())
            .unwrap();
        let (mut parts, _) = req.into_parts();
        let TenantId(tenant) = TenantId::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(tenant, "acme");
    }
}
