//! Request actor metadata for audit entries

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use carebill_billing::ActorMeta;

const FORWARDED_FOR: &str = "x-forwarded-for";
const SESSION_ID: &str = "x-session-id";

/// The caller of a request, lifted from proxy and session headers
#[derive(Debug, Clone)]
pub struct Actor(pub ActorMeta);

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        // Left-most entry is the original client
        let ip = header(FORWARDED_FOR)
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let session = header(SESSION_ID).map(str::to_string);

        Ok(Actor(ActorMeta::user(None, ip, session)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn actor_for(headers: &[(&str, &str)]) -> ActorMeta {
        let mut builder = Request::builder().uri("/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        Actor::from_request_parts(&mut parts, &()).await.unwrap().0
    }

    #[tokio::test]
    async fn test_first_forwarded_address_wins() {
        let meta = actor_for(&[
            ("X-Forwarded-For", "198.51.100.7, 10.0.0.2"),
            ("X-Session-Id", "sess_42"),
        ])
        .await;
        assert_eq!(meta.ip.as_deref(), Some("198.51.100.7"));
        assert_eq!(meta.session_id.as_deref(), Some("sess_42"));
    }

    #[tokio::test]
    async fn test_missing_headers() {
        let meta = actor_for(&[("X-Forwarded-For", "  ")]).await;
        assert!(meta.ip.is_none());
        assert!(meta.session_id.is_none());
    }
}
