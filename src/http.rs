use crate::config::ResilienceSettings;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::{sync::Arc, time::Duration};
use tokio::sync::Semaphore;

/// Shared transport: one pooled client per process plus a bound on
/// concurrent outbound requests.
#[derive(Clone, Debug)]
pub struct Session {
    client: Client,
    permits: Arc<Semaphore>,
    max_connections: usize,
}

impl Session {
    pub fn new(settings: &ResilienceSettings) -> Self {
        let max_connections = settings.max_connections.max(1);
        Self {
            client: build_client(
                max_connections,
                settings.connection_timeout,
                settings.read_timeout,
            ),
            permits: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    #[cfg(test)]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Sends the request and reads the whole body while holding a
    /// connection permit.
    pub async fn send(&self, request: RequestBuilder) -> reqwest::Result<(StatusCode, String)> {
        // The semaphore is never closed.
        let _permit = self.permits.acquire().await.ok();
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        Ok((status, body))
    }
}

pub fn build_client(max_connections: usize, connect: Duration, read: Duration) -> Client {
    Client::builder()
        .pool_max_idle_per_host(max_connections * 2)
        .connect_timeout(connect)
        .read_timeout(read)
        .build()
        .unwrap_or_else(|_| Client::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn session_clones_share_the_same_permit_pool() {
        let settings = ResilienceSettings {
            max_connections: 3,
            ..ResilienceSettings::default()
        };
        let session = Session::new(&settings);
        let clone = session.clone();
        assert_eq!(session.max_connections(), 3);

        let held = session.permits.acquire().await.expect("permit");
        assert_eq!(clone.available_permits(), 2);
        drop(held);
        assert_eq!(clone.available_permits(), 3);
    }

    #[tokio::test]
    async fn sends_beyond_the_permit_pool_wait_for_a_full_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/document"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("sku\tqty\n")
                    .set_delay(Duration::from_millis(300)),
            )
            .expect(2)
            .mount(&server)
            .await;

        let settings = ResilienceSettings {
            max_connections: 1,
            ..ResilienceSettings::default()
        };
        let session = Session::new(&settings);
        let url = format!("{}/document", server.uri());

        let started = std::time::Instant::now();
        let (first, second) = tokio::join!(
            session.send(session.client().get(&url)),
            session.send(session.client().get(&url)),
        );
        assert!(started.elapsed() >= Duration::from_millis(600));
        assert_eq!(first.expect("first"), (StatusCode::OK, "sku\tqty\n".to_string()));
        assert_eq!(second.expect("second").1, "sku\tqty\n");
        assert_eq!(session.available_permits(), 1);
    }
}
