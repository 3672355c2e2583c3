//! HTTP/WS admission rules on top of the token-bucket limiter.
//!
//! Every HTTP request passes up to four buckets in order: the global
//! all-traffic bucket, the per-IP global bucket, the matched rule's
//! cross-IP bucket (when it has one), and the rule's per-IP bucket.
//! Any denial short-circuits into a 429 with `Retry-After`.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use std::net::SocketAddr;

use cf_domain::config::{rpm_to_rps, LimitsConfig};

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rule matching
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpRule {
    CreateSession,
    UploadMedia,
    MediaGet,
    ClearSession,
    ApiGeneral,
}

impl HttpRule {
    pub fn name(&self) -> &'static str {
        match self {
            HttpRule::CreateSession => "create_session",
            HttpRule::UploadMedia => "upload_media",
            HttpRule::MediaGet => "media_get",
            HttpRule::ClearSession => "clear_session",
            HttpRule::ApiGeneral => "api_general",
        }
    }

    /// Per-IP (burst, rpm).
    fn ip_limit(&self, cfg: &LimitsConfig) -> (u64, u64) {
        match self {
            HttpRule::CreateSession => (cfg.create_session_burst, cfg.create_session_rpm),
            HttpRule::UploadMedia => (cfg.upload_media_burst, cfg.upload_media_rpm),
            HttpRule::MediaGet => (cfg.media_get_burst, cfg.media_get_rpm),
            HttpRule::ClearSession => (cfg.clear_session_burst, cfg.clear_session_rpm),
            HttpRule::ApiGeneral => (cfg.api_burst, cfg.api_rpm),
        }
    }

    /// Cross-IP (burst, rpm) for rules that cap the whole fleet.
    fn all_limit(&self, cfg: &LimitsConfig) -> Option<(u64, u64)> {
        match self {
            HttpRule::CreateSession => {
                Some((cfg.create_session_all_burst, cfg.create_session_all_rpm))
            }
            HttpRule::UploadMedia => Some((cfg.upload_media_all_burst, cfg.upload_media_all_rpm)),
            HttpRule::MediaGet => Some((cfg.media_get_all_burst, cfg.media_get_all_rpm)),
            _ => None,
        }
    }
}

/// Which rule a request falls under. Non-API paths only pass the
/// global buckets.
pub fn match_http_rule(method: &Method, path: &str) -> Option<HttpRule> {
    if *method == Method::POST && path == "/api/sessions" {
        return Some(HttpRule::CreateSession);
    }

    if *method == Method::POST && path.starts_with("/api/sessions/") {
        if path.ends_with("/media") || path.ends_with("/media/init") {
            return Some(HttpRule::UploadMedia);
        }
        if path.contains("/media/")
            && (path.ends_with("/chunk") || path.ends_with("/complete") || path.ends_with("/cancel"))
        {
            return Some(HttpRule::UploadMedia);
        }
        if path.ends_with("/clear") {
            return Some(HttpRule::ClearSession);
        }
    }

    if *method == Method::GET
        && path.starts_with("/api/sessions/")
        && (path.ends_with("/thumb") || path.ends_with("/file"))
    {
        return Some(HttpRule::MediaGet);
    }

    if path.starts_with("/api/") {
        return Some(HttpRule::ApiGeneral);
    }
    None
}

/// Upload requests pay per size: one token per `upload_cost_bytes` of
/// body, minimum one.
pub fn upload_cost(content_length: Option<u64>, cost_bytes: u64) -> f64 {
    match content_length {
        Some(len) if len > 0 && cost_bytes > 0 => (len as f64 / cost_bytes as f64).ceil().max(1.0),
        _ => 1.0,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client IP
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Proxy headers are only honored when explicitly trusted.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> String {
    if trust_proxy {
        if let Some(xff) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            if let Some(first) = xff.split(',').next().map(str::trim).filter(|s| !s.is_empty()) {
                return first.to_string();
            }
        }
        if let Some(xri) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
            let trimmed = xri.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Admission sequences
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run the HTTP bucket sequence. `Err(retry_after_secs)` on denial.
pub fn admit_http(
    state: &AppState,
    method: &Method,
    path: &str,
    ip: &str,
    content_length: Option<u64>,
) -> Result<(), u64> {
    let cfg = &state.config.limits;
    let limiter = &state.limiter;

    // 0) All traffic, all IPs.
    let d = limiter.allow(
        "http:all",
        cfg.http_all_burst as f64,
        rpm_to_rps(cfg.http_all_rpm),
        1.0,
    );
    if !d.allowed {
        return Err(d.retry_after_secs());
    }

    // 1) All traffic, this IP.
    let d = limiter.allow(
        &format!("http:global:{ip}"),
        cfg.http_global_burst as f64,
        rpm_to_rps(cfg.http_global_rpm),
        1.0,
    );
    if !d.allowed {
        return Err(d.retry_after_secs());
    }

    // 2) Matched rule.
    let Some(rule) = match_http_rule(method, path) else {
        return Ok(());
    };
    let cost = if rule == HttpRule::UploadMedia {
        upload_cost(content_length, cfg.upload_cost_bytes)
    } else {
        1.0
    };

    if let Some((burst, rpm)) = rule.all_limit(cfg) {
        let d = limiter.allow(
            &format!("http:{}:all", rule.name()),
            burst as f64,
            rpm_to_rps(rpm),
            cost,
        );
        if !d.allowed {
            return Err(d.retry_after_secs());
        }
    }

    let (burst, rpm) = rule.ip_limit(cfg);
    let d = limiter.allow(
        &format!("http:{}:{ip}", rule.name()),
        burst as f64,
        rpm_to_rps(rpm),
        cost,
    );
    if !d.allowed {
        return Err(d.retry_after_secs());
    }
    Ok(())
}

/// Media-count admission: `cost` = number of files (1 for init).
pub fn admit_upload_count(state: &AppState, ip: &str, cost: f64) -> Result<(), u64> {
    let cfg = &state.config.limits;

    let d = state.limiter.allow(
        "http:upload_media_count:all",
        cfg.upload_media_count_all_burst as f64,
        rpm_to_rps(cfg.upload_media_count_all_rpm),
        cost,
    );
    if !d.allowed {
        return Err(d.retry_after_secs());
    }

    let d = state.limiter.allow(
        &format!("http:upload_media_count:{ip}"),
        cfg.upload_media_count_burst as f64,
        rpm_to_rps(cfg.upload_media_count_rpm),
        cost,
    );
    if !d.allowed {
        return Err(d.retry_after_secs());
    }
    Ok(())
}

pub fn admit_ws_connect(state: &AppState, ip: &str) -> Result<(), u64> {
    let cfg = &state.config.limits;
    let d = state.limiter.allow(
        &format!("ws:connect:{ip}"),
        cfg.ws_connect_burst as f64,
        rpm_to_rps(cfg.ws_connect_rpm),
        1.0,
    );
    if !d.allowed {
        return Err(d.retry_after_secs());
    }
    Ok(())
}

/// chat.send admission: global bucket first, then per IP.
pub fn admit_chat_send(state: &AppState, ip: &str) -> Result<(), u64> {
    let cfg = &state.config.limits;

    let d = state.limiter.allow(
        "ws:chat_send:all",
        cfg.ws_chat_send_all_burst as f64,
        rpm_to_rps(cfg.ws_chat_send_all_rpm),
        1.0,
    );
    if !d.allowed {
        return Err(d.retry_after_secs());
    }

    let d = state.limiter.allow(
        &format!("ws:chat_send:{ip}"),
        cfg.ws_chat_send_burst as f64,
        rpm_to_rps(cfg.ws_chat_send_rpm),
        1.0,
    );
    if !d.allowed {
        return Err(d.retry_after_secs());
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Middleware
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The 429 wire shape shared by middleware and handlers.
pub fn reject_429(retry_after: u64) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, retry_after.to_string())],
        Json(json!({"detail": "Too Many Requests", "retry_after": retry_after})),
    )
        .into_response()
}

/// axum middleware applying [`admit_http`] to every request.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let ip = client_ip(
        request.headers(),
        peer,
        state.config.limits.trust_proxy_headers,
    );
    let content_length = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    match admit_http(&state, &method, &path, &ip, content_length) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            tracing::debug!(%method, path, ip, retry_after, "rate limited");
            reject_429(retry_after)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_matching_table() {
        use HttpRule::*;
        let post = Method::POST;
        let get = Method::GET;
        let cases = [
            (&post, "/api/sessions", Some(CreateSession)),
            (&get, "/api/sessions", Some(ApiGeneral)),
            (&post, "/api/sessions/s1/media", Some(UploadMedia)),
            (&post, "/api/sessions/s1/media/init", Some(UploadMedia)),
            (&post, "/api/sessions/s1/media/u1/chunk", Some(UploadMedia)),
            (&post, "/api/sessions/s1/media/u1/complete", Some(UploadMedia)),
            (&post, "/api/sessions/s1/media/u1/cancel", Some(UploadMedia)),
            (&get, "/api/sessions/s1/media/m1/thumb", Some(MediaGet)),
            (&get, "/api/sessions/s1/media/m1/file", Some(MediaGet)),
            (&post, "/api/sessions/s1/clear", Some(ClearSession)),
            (&get, "/api/templates", Some(ApiGeneral)),
            (&get, "/static/app.js", None),
            (&get, "/", None),
        ];
        for (method, path, expected) in cases {
            assert_eq!(match_http_rule(method, path), expected, "{method} {path}");
        }
    }

    #[test]
    fn upload_cost_scales_with_content_length() {
        let mib = 1024 * 1024;
        assert_eq!(upload_cost(None, 10 * mib), 1.0);
        assert_eq!(upload_cost(Some(0), 10 * mib), 1.0);
        assert_eq!(upload_cost(Some(1), 10 * mib), 1.0);
        assert_eq!(upload_cost(Some(10 * mib), 10 * mib), 1.0);
        assert_eq!(upload_cost(Some(10 * mib + 1), 10 * mib), 2.0);
        assert_eq!(upload_cost(Some(95 * mib), 10 * mib), 10.0);
    }

    #[test]
    fn client_ip_respects_trust_flag() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        let peer: SocketAddr = "192.0.2.1:443".parse().unwrap();

        assert_eq!(client_ip(&headers, Some(peer), true), "203.0.113.9");
        assert_eq!(client_ip(&headers, Some(peer), false), "192.0.2.1");
        assert_eq!(client_ip(&HeaderMap::new(), None, false), "unknown");
    }

    #[test]
    fn x_real_ip_is_second_choice() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "198.51.100.7".parse().unwrap());
        assert_eq!(client_ip(&headers, None, true), "198.51.100.7");
    }
}
