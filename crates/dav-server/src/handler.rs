// SPDX-License-Identifier: AGPL-3.0-only
//! Read-only downstream handler: serves file downloads and refuses the rest.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::{ALLOW, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{Method, Request, Response, StatusCode};
use percent_encoding::percent_decode_str;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};
use usg_dav_gate::{DavBackend, DavHandler, FsError};

const ALLOWED: &str = "GET";

#[derive(Debug, Default, Clone, Copy)]
pub struct ReadOnlyHandler;

fn status_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

fn method_not_allowed() -> Response<Body> {
    let mut response = status_response(StatusCode::METHOD_NOT_ALLOWED);
    response
        .headers_mut()
        .insert(ALLOW, axum::http::HeaderValue::from_static(ALLOWED));
    response
}

fn fs_error_response(connection_id: &str, path: &str, err: &FsError) -> Response<Body> {
    match err {
        FsError::NotFound(_) => status_response(StatusCode::NOT_FOUND),
        FsError::InvalidPath(_) => status_response(StatusCode::BAD_REQUEST),
        FsError::Io(_) | FsError::Unavailable(_) => {
            warn!(connection_id, path, error = %err, "unable to serve file");
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[async_trait]
impl DavHandler for ReadOnlyHandler {
    async fn serve(&self, request: Request<Body>, connection: Arc<dyn DavBackend>) -> Response<Body> {
        if request.method() != Method::GET {
            debug!(connection_id = %connection.id(), method = %request.method(), "method not supported");
            return method_not_allowed();
        }
        let path = percent_decode_str(request.uri().path())
            .decode_utf8_lossy()
            .into_owned();

        let info = match connection.stat(&path).await {
            Ok(info) => info,
            Err(e) => return fs_error_response(connection.id(), &path, &e),
        };
        if info.is_dir {
            return method_not_allowed();
        }

        let mut reader = match connection.open(&path).await {
            Ok(reader) => reader,
            Err(e) => return fs_error_response(connection.id(), &path, &e),
        };
        let mut content = Vec::with_capacity(info.size as usize);
        if let Err(e) = reader.read_to_end(&mut content).await {
            return fs_error_response(connection.id(), &path, &FsError::Io(e));
        }

        let mut response = Response::new(Body::from(content));
        let headers = response.headers_mut();
        headers.insert(
            CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/octet-stream"),
        );
        headers.insert(CONTENT_LENGTH, info.size.into());
        response
    }
}
