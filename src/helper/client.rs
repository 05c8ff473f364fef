use axum::Router;
use axum::body::{Body, Bytes, to_bytes};
use axum::http::{HeaderMap, Method, Request, StatusCode, header};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tower::ServiceExt;

use crate::error::{HelperError, Result};

/// Issues requests straight against the admin router, no socket involved.
#[derive(Clone, Debug)]
pub struct AdminClient {
    router: Router,
}

impl AdminClient {
    pub(crate) fn new(router: Router) -> Self {
        Self { router }
    }

    pub async fn get(&self, path: &str) -> Result<AdminResponse> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .map_err(|err| HelperError::Request(err.to_string()))?;
        self.send(request).await
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> Result<AdminResponse> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .map_err(|err| HelperError::Request(err.to_string()))?;
        self.send(request).await
    }

    pub async fn send(&self, request: Request<Body>) -> Result<AdminResponse> {
        let response = match self.router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .map_err(|err| HelperError::Request(err.to_string()))?;
        Ok(AdminResponse {
            status,
            headers,
            body,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AdminResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl AdminResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|err| {
            HelperError::Request(format!("response is not the expected json: {err}"))
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}
