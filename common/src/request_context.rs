use axum::{
    body::Body,
    extract::{ConnectInfo, FromRequestParts},
    http::{HeaderMap, Request, StatusCode, request::Parts},
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};
use std::{
    future::Future,
    net::{IpAddr, SocketAddr},
    time::SystemTime,
};
use uuid::Uuid;

/// Stored per-request in `request.extensions()`.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub client_ip: Option<IpAddr>,
    pub received_at: SystemTime,
}

/// Axum extractor usage: `RequestContextExtractor(ctx): RequestContextExtractor`
pub struct RequestContextExtractor(pub RequestContext);

impl std::ops::Deref for RequestContextExtractor {
    type Target = RequestContext;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<S> FromRequestParts<S> for RequestContextExtractor
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let ctx = parts.extensions.get::<RequestContext>().cloned();

        async move {
            ctx.map(RequestContextExtractor).ok_or((
                StatusCode::INTERNAL_SERVER_ERROR,
                "RequestContext missing (did you add the middleware?)",
            ))
        }
    }
}

pub mod middleware {
    use super::*;

    /// Injects a `RequestContext` extension and echoes `x-request-id` on the response.
    pub async fn extract_context(mut req: Request<Body>, next: Next) -> Response {
        let headers = req.headers();
        let request_id = extract_or_generate_request_id(headers);
        let client_ip = extract_client_ip(headers).or_else(|| {
            // If you add `into_make_service_with_connect_info::<SocketAddr>()`,
            // Axum will populate ConnectInfo for you.
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        });
        let ctx = RequestContext {
            request_id,
            client_ip,
            received_at: SystemTime::now(),
        };
        req.extensions_mut().insert(ctx);
        let mut res = next.run(req).await;
        res.headers_mut()
            .insert("x-request-id", request_id.to_string().parse().unwrap());
        res
    }
}

fn extract_or_generate_request_id(headers: &HeaderMap) -> Uuid {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s.trim()).ok())
        .unwrap_or_else(Uuid::new_v4)
}

fn extract_client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    // Prefer first IP in X-Forwarded-For (client, proxy1, proxy2...)
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok())
        && let Some(ip) = xff
            .split(',')
            .map(|s| s.trim())
            .find_map(|s| s.parse::<IpAddr>().ok())
    {
        return Some(ip);
    }

    // Some proxies set X-Real-IP
    if let Some(xri) = headers.get("x-real-ip").and_then(|v| v.to_str().ok())
        && let Ok(ip) = xri.trim().parse::<IpAddr>()
    {
        return Some(ip);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_request_id_when_header_missing() {
        let headers = HeaderMap::new();
        assert!(extract_or_generate_request_id(&headers) != Uuid::nil());
    }

    #[test]
    fn reuses_valid_request_id_header() {
        let id = Uuid::new_v4();
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", id.to_string().parse().unwrap());
        assert_eq!(extract_or_generate_request_id(&headers), id);
    }

    #[test]
    fn falls_back_on_malformed_request_id_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", "not-a-uuid".parse().unwrap());
        assert!(extract_or_generate_request_id(&headers) != Uuid::nil());
    }

    #[test]
    fn prefers_first_xff_entry() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.5, 10.0.0.1".parse().unwrap());
        assert_eq!(
            extract_client_ip(&headers),
            Some("203.0.113.5".parse().unwrap())
        );
    }

    #[test]
    fn falls_back_to_x_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "198.51.100.7".parse().unwrap());
        assert_eq!(
            extract_client_ip(&headers),
            Some("198.51.100.7".parse().unwrap())
        );
    }
}
