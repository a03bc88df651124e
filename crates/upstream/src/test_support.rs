//! Throwaway hosting-API servers for poller tests.

use std::sync::Arc;

use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;

pub(crate) const TEST_TOKEN: &str = "test12345";
pub(crate) const TEST_ETAG: &str = r#"W/"878f43039ad0553d0d3122d8bc171b01""#;

/// Serves `body` for one path when the request looks the way the real API
/// expects, and answers like the real API would otherwise.
#[derive(Clone)]
pub(crate) struct FakeApi {
    pub path: &'static str,
    /// Required `ref_name` query value, if any.
    pub ref_name: Option<&'static str>,
    pub auth_header: &'static str,
    /// Exact credential header value required; `None` rejects any credential.
    pub expected_auth: Option<String>,
    pub accept: &'static str,
    pub etag: &'static str,
    pub body: String,
}

impl FakeApi {
    fn respond(&self, uri: &Uri, headers: &HeaderMap) -> Response {
        if uri.path() != self.path {
            return StatusCode::NOT_FOUND.into_response();
        }
        if let Some(wanted) = self.ref_name {
            let query = uri.query().unwrap_or_default();
            if !query.split('&').any(|pair| pair == format!("ref_name={wanted}")) {
                return StatusCode::NOT_ACCEPTABLE.into_response();
            }
        }

        let auth = headers.get(self.auth_header).and_then(|v| v.to_str().ok());
        match (&self.expected_auth, auth) {
            (Some(wanted), Some(got)) if wanted == got => {}
            (Some(_), _) => return StatusCode::NOT_FOUND.into_response(),
            (None, Some(_)) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            (None, None) => {}
        }

        let if_none_match = headers
            .get(header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if if_none_match == self.etag {
            return StatusCode::NOT_MODIFIED.into_response();
        }

        let accept = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok());
        if accept != Some(self.accept) {
            return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
        }

        (
            StatusCode::OK,
            [(header::ETAG, self.etag), (header::CONTENT_TYPE, "application/json")],
            self.body.clone(),
        )
            .into_response()
    }

    /// Binds an ephemeral port and returns the server's base URL.
    pub(crate) async fn serve(self) -> String {
        let api = Arc::new(self);
        let app = Router::new().fallback(move |uri: Uri, headers: HeaderMap| {
            let api = Arc::clone(&api);
            async move { api.respond(&uri, &headers) }
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let addr = listener.local_addr().expect("local address");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("fake API server");
        });
        format!("http://{addr}")
    }
}
