//! HTTP object service backend
//!
//! Objects live at `<base_url>/<bucket>/<key>`; `PUT` stores, `GET` fetches
//! and `HEAD <base_url>/<bucket>` probes. A bearer token, when configured,
//! comes from the environment, never from the config file.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

use super::{validate_key, ObjectStore, StorageError};

const USER_AGENT: &str = concat!("stratix-ingest/", env!("CARGO_PKG_VERSION"));

pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
    bucket: String,
    token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(
        base_url: &str,
        bucket: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| StorageError::Rejected(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            bucket: bucket.trim_matches('/').to_string(),
            token,
        })
    }

    fn bucket_url(&self) -> String {
        format!("{}/{}", self.base_url, self.bucket)
    }

    fn object_url(&self, key: &str) -> Result<String, StorageError> {
        validate_key(key)?;
        Ok(format!("{}/{}", self.bucket_url(), key))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

fn send_error(err: reqwest::Error) -> StorageError {
    StorageError::Unavailable(err.to_string())
}

/// Map a non-success status to a storage error
fn status_error(key: &str, status: StatusCode) -> StorageError {
    if status == StatusCode::NOT_FOUND {
        StorageError::NotFound(key.to_string())
    } else if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        StorageError::Unavailable(format!("{} returned {}", key, status))
    } else {
        StorageError::Rejected(format!("{} returned {}", key, status))
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let url = self.object_url(key)?;
        debug!(url = %url, bytes = bytes.len(), "PUT object");

        let response = self
            .authorize(self.client.put(&url))
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(send_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(key, status));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let url = self.object_url(key)?;
        debug!(url = %url, "GET object");

        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(send_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(key, status));
        }
        let bytes = response.bytes().await.map_err(send_error)?;
        Ok(bytes.to_vec())
    }

    async fn probe(&self) -> Result<(), StorageError> {
        let response = self
            .authorize(self.client.head(self.bucket_url()))
            .send()
            .await
            .map_err(send_error)?;

        // Any answer below 500 proves the service is up
        let status = response.status();
        if status.is_server_error() {
            return Err(StorageError::Unavailable(format!(
                "bucket probe returned {}",
                status
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Bytes,
        extract::{Path, State},
        http::StatusCode as AxumStatus,
        routing::{get, head},
        Router,
    };
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    type Objects = Arc<Mutex<HashMap<String, Vec<u8>>>>;

    async fn put_object(
        State(objects): State<Objects>,
        Path((_bucket, key)): Path<(String, String)>,
        body: Bytes,
    ) -> AxumStatus {
        objects.lock().unwrap().insert(key, body.to_vec());
        AxumStatus::CREATED
    }

    async fn get_object(
        State(objects): State<Objects>,
        Path((_bucket, key)): Path<(String, String)>,
    ) -> Result<Vec<u8>, AxumStatus> {
        objects
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or(AxumStatus::NOT_FOUND)
    }

    async fn spawn_server() -> String {
        let objects: Objects = Arc::default();
        let app = Router::new()
            .route("/:bucket", head(|| async { AxumStatus::OK }))
            .route("/:bucket/*key", get(get_object).put(put_object))
            .with_state(objects);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_round_trip_against_live_server() {
        let base = spawn_server().await;
        let store =
            HttpObjectStore::new(&base, "imports", None, Duration::from_secs(2)).unwrap();

        store.probe().await.unwrap();
        store.put("t1/j1/areas.csv", b"name\nOps\n").await.unwrap();
        assert_eq!(store.get("t1/j1/areas.csv").await.unwrap(), b"name\nOps\n");
        assert!(matches!(
            store.get("t1/j1/missing.csv").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let store = HttpObjectStore::new(
            &format!("http://{}", addr),
            "imports",
            None,
            Duration::from_millis(500),
        )
        .unwrap();
        assert!(matches!(store.probe().await, Err(StorageError::Unavailable(_))));
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_error("k", StatusCode::SERVICE_UNAVAILABLE),
            StorageError::Unavailable(_)
        ));
        assert!(matches!(
            status_error("k", StatusCode::FORBIDDEN),
            StorageError::Rejected(_)
        ));
        assert!(matches!(
            status_error("k", StatusCode::NOT_FOUND),
            StorageError::NotFound(_)
        ));
    }
}
