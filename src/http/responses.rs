//! Responses the proxy synthesizes itself.

use http::header::{CONNECTION, CONTENT_TYPE, PROXY_AUTHENTICATE};
use http::{HeaderValue, Method, StatusCode};

use crate::http::headers::ensure_date;
use crate::http::message::{Body, HttpResponse};

const HTML: HeaderValue = HeaderValue::from_static("text/html; charset=utf-8");
const TEXT: HeaderValue = HeaderValue::from_static("text/plain; charset=utf-8");

const AUTHENTICATION_REQUIRED_BODY: &str = "<!DOCTYPE HTML PUBLIC \"-//IETF//DTD HTML 2.0//EN\">\n\
<html><head>\n\
<title>407 Proxy Authentication Required</title>\n\
</head><body>\n\
<h1>Proxy Authentication Required</h1>\n\
<p>This server could not verify that you\n\
are authorized to access the document\n\
requested.  Either you supplied the wrong\n\
credentials (e.g., bad password), or your\n\
browser doesn't understand how to supply\n\
the credentials required.</p>\n\
</body></html>\n";

fn synthesized(status: StatusCode, body: String, content_type: HeaderValue) -> HttpResponse {
    let mut response = HttpResponse::full(status, body);
    response.headers.insert(CONTENT_TYPE, content_type);
    ensure_date(&mut response.headers);
    response
}

fn closing(status: StatusCode, body: String) -> HttpResponse {
    let mut response = synthesized(status, body, TEXT);
    response
        .headers
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

/// 407 challenging the client for Basic credentials.
pub fn authentication_required(realm: &str) -> HttpResponse {
    let mut response = synthesized(
        StatusCode::PROXY_AUTHENTICATION_REQUIRED,
        AUTHENTICATION_REQUIRED_BODY.to_string(),
        HTML,
    );
    let challenge = format!("Basic realm=\"{}\"", realm.replace('"', "'"));
    let challenge = HeaderValue::from_str(&challenge)
        .unwrap_or_else(|_| HeaderValue::from_static("Basic realm=\"Restricted Files\""));
    response.headers.insert(PROXY_AUTHENTICATE, challenge);
    response
}

/// 502 for an unreachable or misbehaving upstream.
pub fn bad_gateway(uri: &str) -> HttpResponse {
    synthesized(StatusCode::BAD_GATEWAY, format!("Bad Gateway: {}", uri), TEXT)
}

/// 504 for an upstream that stopped answering.
pub fn gateway_timeout() -> HttpResponse {
    synthesized(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout".to_string(), TEXT)
}

/// 400 for a request addressed to the proxy as if it were the origin.
pub fn bad_request(uri: &str) -> HttpResponse {
    synthesized(StatusCode::BAD_REQUEST, format!("Bad Request to URI: {}", uri), TEXT)
}

/// 400 for bytes that could not be decoded; the connection is unusable afterwards.
pub fn malformed_request() -> HttpResponse {
    closing(StatusCode::BAD_REQUEST, "Bad Request".to_string())
}

/// Reply to a CONNECT once the tunnel is in place.
pub fn connection_established() -> HttpResponse {
    let mut response = HttpResponse::new(StatusCode::OK);
    response.reason = Some("Connection established".to_string());
    response
}

/// Responses to HEAD never carry a body.
pub fn for_method(mut response: HttpResponse, method: &Method) -> HttpResponse {
    if method == Method::HEAD {
        response.body = Body::empty();
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CONTENT_LENGTH, DATE};

    #[test]
    fn authentication_required_challenges_for_basic() {
        let response = authentication_required("Restricted Files");
        assert_eq!(response.status, StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert_eq!(
            response.headers[PROXY_AUTHENTICATE],
            "Basic realm=\"Restricted Files\""
        );
        assert!(response.headers.contains_key(DATE));
        assert!(response.is_keep_alive());
    }

    #[test]
    fn bad_gateway_names_the_uri() {
        let response = bad_gateway("http://nowhere.invalid/");
        assert_eq!(response.status, StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.body,
            Body::Full("Bad Gateway: http://nowhere.invalid/".into())
        );
        assert!(response.is_keep_alive());
    }

    #[test]
    fn malformed_request_closes() {
        assert!(!malformed_request().is_keep_alive());
    }

    #[test]
    fn head_responses_drop_the_body_but_keep_length() {
        let response = for_method(gateway_timeout(), &Method::HEAD);
        assert_eq!(response.body, Body::empty());
        assert_eq!(response.headers[CONTENT_LENGTH], "15");
    }
}
