// SPDX-License-Identifier: AGPL-3.0-only
//! Directory GET/HEAD handling (RFC 4918, section 9.4).

use crate::fs::clean_path;
use crate::registry::DavBackend;
use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use percent_encoding::percent_decode_str;

const DEPTH: HeaderName = HeaderName::from_static("depth");

/// Rewrite a directory GET into a shallow PROPFIND. Returns true when the
/// request is a HEAD on a directory, which the caller answers itself.
pub async fn maybe_rewrite<B>(request: &mut Request<B>, connection: &dyn DavBackend) -> bool {
    let method = request.method();
    if method != Method::GET && method != Method::HEAD {
        return false;
    }

    let decoded = percent_decode_str(request.uri().path()).decode_utf8_lossy();
    let path = clean_path(&decoded);
    let Ok(info) = connection.stat(&path).await else {
        return false;
    };
    if !info.is_dir {
        return false;
    }
    if request.method() == Method::HEAD {
        return true;
    }

    let Ok(propfind) = Method::from_bytes(b"PROPFIND") else {
        return false;
    };
    *request.method_mut() = propfind;
    let has_depth = request
        .headers()
        .get(DEPTH)
        .is_some_and(|v| !v.as_bytes().is_empty());
    if !has_depth {
        request
            .headers_mut()
            .insert(DEPTH, HeaderValue::from_static("1"));
    }
    false
}

/// 207 with an empty body, sent for HEAD on a directory.
pub fn multistatus_head_response() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::MULTI_STATUS;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/xml; charset=utf-8"),
    );
    response
}
