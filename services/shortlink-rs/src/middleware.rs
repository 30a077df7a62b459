//! Request identity, client-IP derivation, rate-limit admission, and the
//! middleware chain the router is composed through.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::ratelimit::Decision;
use crate::state::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const REAL_IP_HEADER: &str = "x-real-ip";

const MAX_REQUEST_ID_LEN: usize = 128;

/// Request id attached to request extensions by [`request_id`].
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Inbound ids are adopted only when they are nonempty, at most 128 bytes,
/// and drawn from `[A-Za-z0-9_-]`.
pub fn is_valid_request_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_REQUEST_ID_LEN
        && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Adopts or mints the request id, stores it in request extensions, and
/// echoes it in the response header.
pub async fn request_id(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| is_valid_request_id(v))
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

fn unbracket(s: &str) -> &str {
    s.strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(s)
}

/// Resolves the client IP honoring the trust-proxy policy: forwarded
/// headers are consulted only when the peer itself is a trusted proxy (or
/// the trusted set is empty while trust is enabled).
pub fn resolve_client_ip(
    peer: Option<IpAddr>,
    headers: &HeaderMap,
    trust_proxy: bool,
    trusted_proxies: &[IpAddr],
) -> String {
    let peer_text = || peer.map(|ip| ip.to_string()).unwrap_or_else(|| "unknown".to_string());

    if !trust_proxy {
        return peer_text();
    }
    if let Some(peer_ip) = peer {
        if !trusted_proxies.is_empty() && !trusted_proxies.contains(&peer_ip) {
            return peer_text();
        }
    }

    if let Some(forwarded) = headers.get(FORWARDED_FOR_HEADER).and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty()) {
            return unbracket(first).to_string();
        }
    }
    if let Some(real_ip) = headers.get(REAL_IP_HEADER).and_then(|v| v.to_str().ok()) {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return unbracket(trimmed).to_string();
        }
    }
    peer_text()
}

/// Builds the rate-limit identifier: `"api:" + key` when the configured API
/// key header carries a nonempty value, else `"ip:" + client_ip`.
fn limit_identifier(state: &AppState, headers: &HeaderMap, peer: Option<IpAddr>) -> String {
    if let Some(header_name) = &state.config.api_key_header {
        if let Some(key) = headers.get(header_name.as_str()).and_then(|v| v.to_str().ok()) {
            let key = key.trim();
            if !key.is_empty() {
                return format!("api:{key}");
            }
        }
    }
    let ip = resolve_client_ip(
        peer,
        headers,
        state.config.trust_proxy,
        &state.config.trusted_proxies,
    );
    format!("ip:{ip}")
}

fn set_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    if let Ok(value) = decision.limit.to_string().parse() {
        headers.insert("x-ratelimit-limit", value);
    }
    if let Ok(value) = decision.remaining.max(0).to_string().parse() {
        headers.insert("x-ratelimit-remaining", value);
    }
    if !decision.reset_after.is_zero() {
        let reset_unix = Utc::now().timestamp() + decision.reset_after.as_secs() as i64;
        if let Ok(value) = reset_unix.to_string().parse() {
            headers.insert("x-ratelimit-reset", value);
        }
    }
}

/// Admission middleware. Fails open on limiter faults: blocking the hot
/// path on an internal limiter error is worse than over-admitting.
pub async fn rate_limit(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let limiter = match &state.limiter {
        Some(limiter) => Arc::clone(limiter),
        None => return next.run(req).await,
    };

    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());
    let identifier = limit_identifier(&state, req.headers(), peer);

    let decision = match limiter.allow(&identifier, &state.shutdown) {
        Ok(decision) => decision,
        Err(e) => {
            tracing::warn!(error = %e, identifier, "rate limiter fault, admitting");
            return next.run(req).await;
        }
    };

    if !decision.allowed {
        state.metrics.rate_limited_total.inc();
        let mut response = ServiceError::RateLimited {
            retry_after_secs: decision.retry_after.as_secs().max(1),
        }
        .into_response();
        set_rate_limit_headers(response.headers_mut(), &decision);
        return response;
    }

    let mut response = next.run(req).await;
    set_rate_limit_headers(response.headers_mut(), &decision);
    response
}

// ── Middleware chain ──────────────────────────────────────────────────────────

/// One link in a [`Chain`]: wraps a handler, returning the wrapped handler.
pub trait Middleware<H>: Send + Sync {
    fn wrap(&self, next: H) -> H;
}

impl<H, F> Middleware<H> for F
where
    F: Fn(H) -> H + Send + Sync,
{
    fn wrap(&self, next: H) -> H {
        self(next)
    }
}

/// An ordered middleware chain. `then` wraps the terminal handler
/// right-to-left, so the leftmost middleware sees the request first and the
/// response last. `append`/`extend` are pure: the original chain is
/// untouched.
pub struct Chain<H> {
    middlewares: Vec<Arc<dyn Middleware<H>>>,
}

impl<H> Clone for Chain<H> {
    fn clone(&self) -> Self {
        Self {
            middlewares: self.middlewares.clone(),
        }
    }
}

impl<H> Default for Chain<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> Chain<H> {
    pub fn new() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }

    pub fn append(&self, middleware: impl Middleware<H> + 'static) -> Self {
        let mut middlewares = self.middlewares.clone();
        middlewares.push(Arc::new(middleware));
        Self { middlewares }
    }

    pub fn extend(&self, other: &Self) -> Self {
        let mut middlewares = self.middlewares.clone();
        middlewares.extend(other.middlewares.iter().cloned());
        Self { middlewares }
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub fn then(&self, terminal: H) -> H {
        self.middlewares
            .iter()
            .rev()
            .fold(terminal, |next, middleware| middleware.wrap(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_validation() {
        assert!(is_valid_request_id("abc-123_DEF"));
        assert!(is_valid_request_id(&"a".repeat(128)));
        assert!(!is_valid_request_id(""));
        assert!(!is_valid_request_id(&"a".repeat(129)));
        assert!(!is_valid_request_id("has space"));
        assert!(!is_valid_request_id("semi;colon"));
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn peer_ip_wins_without_trust() {
        let h = headers(&[("x-forwarded-for", "203.0.113.9")]);
        assert_eq!(resolve_client_ip(Some(ip("198.51.100.7")), &h, false, &[]), "198.51.100.7");
    }

    #[test]
    fn untrusted_peer_ignores_forwarded_headers() {
        let h = headers(&[("x-forwarded-for", "203.0.113.9")]);
        let trusted = [ip("10.0.0.1")];
        assert_eq!(
            resolve_client_ip(Some(ip("198.51.100.7")), &h, true, &trusted),
            "198.51.100.7"
        );
    }

    #[test]
    fn trusted_peer_uses_first_forwarded_value() {
        let h = headers(&[("x-forwarded-for", " , 203.0.113.9 , 10.0.0.2")]);
        let trusted = [ip("10.0.0.1")];
        assert_eq!(
            resolve_client_ip(Some(ip("10.0.0.1")), &h, true, &trusted),
            "203.0.113.9"
        );
    }

    #[test]
    fn empty_trusted_set_still_consults_headers() {
        let h = headers(&[("x-real-ip", " 203.0.113.5 ")]);
        assert_eq!(resolve_client_ip(Some(ip("198.51.100.7")), &h, true, &[]), "203.0.113.5");
    }

    #[test]
    fn forwarded_ipv6_is_unbracketed() {
        let h = headers(&[("x-forwarded-for", "[2001:db8::1]")]);
        assert_eq!(resolve_client_ip(Some(ip("10.0.0.1")), &h, true, &[]), "2001:db8::1");
    }

    #[test]
    fn falls_back_to_peer_when_headers_are_empty() {
        let h = headers(&[("x-forwarded-for", " , ")]);
        assert_eq!(resolve_client_ip(Some(ip("198.51.100.7")), &h, true, &[]), "198.51.100.7");
    }

    type Trace = Arc<std::sync::Mutex<Vec<String>>>;
    type Handler = Arc<dyn Fn(&Trace) + Send + Sync>;

    fn tracing_middleware(name: &'static str) -> impl Fn(Handler) -> Handler {
        move |next: Handler| {
            let wrapped: Handler = Arc::new(move |trace: &Trace| {
                trace.lock().unwrap().push(format!("{name}:enter"));
                next(trace);
                trace.lock().unwrap().push(format!("{name}:exit"));
            });
            wrapped
        }
    }

    #[test]
    fn chain_wraps_left_to_right() {
        let chain: Chain<Handler> = Chain::new()
            .append(tracing_middleware("outer"))
            .append(tracing_middleware("inner"));
        let terminal: Handler = Arc::new(|trace: &Trace| {
            trace.lock().unwrap().push("terminal".to_string());
        });

        let handler = chain.then(terminal);
        let trace: Trace = Arc::default();
        handler(&trace);

        assert_eq!(
            *trace.lock().unwrap(),
            vec!["outer:enter", "inner:enter", "terminal", "inner:exit", "outer:exit"]
        );
    }

    #[test]
    fn append_and_extend_are_pure() {
        let base: Chain<Handler> = Chain::new().append(tracing_middleware("a"));
        let longer = base.append(tracing_middleware("b"));
        assert_eq!(base.len(), 1);
        assert_eq!(longer.len(), 2);

        let combined = base.extend(&longer);
        assert_eq!(base.len(), 1);
        assert_eq!(longer.len(), 2);
        assert_eq!(combined.len(), 3);
    }
}
