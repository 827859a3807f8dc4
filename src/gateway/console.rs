//! Console fallback: static assets and the single-page app shell

use std::convert::Infallible;

use axum::{
    body::Body,
    extract::Request,
    response::{IntoResponse, Response},
};
use tower::ServiceExt;
use tower_http::services::{ServeDir, ServeFile};

use super::{AppState, tokens::login_redirect};
use crate::{Error, token};

/// Serve anything no component route claimed.
///
/// Asset paths are public. Page paths need a live session and otherwise
/// start the browser login, returning to the requested page.
pub async fn serve(state: &AppState, req: Request) -> Response {
    let Some(dir) = &state.console_dir else {
        return Error::NotFound(format!("no route for {}", req.uri().path())).into_response();
    };

    if is_asset(req.uri().path()) {
        return into_response(ServeDir::new(dir).oneshot(req).await);
    }

    if token::valid_from_headers(req.headers()).is_err() {
        let target = req
            .uri()
            .path_and_query()
            .map_or("/", |pq| pq.as_str());
        return login_redirect(state, req.headers(), target)
            .unwrap_or_else(IntoResponse::into_response);
    }

    into_response(ServeFile::new(dir.join("index.html")).oneshot(req).await)
}

fn into_response<B>(result: Result<axum::http::Response<B>, Infallible>) -> Response
where
    B: axum::body::HttpBody<Data = bytes::Bytes> + Send + 'static,
    B::Error: Into<axum::BoxError>,
{
    match result {
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    }
}

/// Last path segment has an extension
fn is_asset(path: &str) -> bool {
    path.rsplit('/')
        .next()
        .is_some_and(|segment| segment.contains('.'))
}
