//! Helpers shared by the unit tests: in-process clients with short timeouts and
//! bounded waits on channels.

use std::time::Duration;

use crate::Client;
use crate::ClientConfig;
use crate::MemoryEnsemble;
use crate::RetryPolicy;
use crate::WatchEvent;
use crate::WatchRegistration;

pub(crate) const TEST_ENDPOINT: &str = "n1:2181";

pub(crate) const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn test_config() -> ClientConfig {
    ClientConfig {
        endpoints: vec![TEST_ENDPOINT.to_string()],
        session_timeout_ms: 1000,
        connect_timeout_ms: 200,
        request_timeout_ms: 2000,
        retry: RetryPolicy::fixed(5, Duration::from_millis(20)),
    }
}

pub(crate) async fn memory_client(ensemble: &MemoryEnsemble) -> Client {
    memory_client_with(ensemble, test_config()).await
}

pub(crate) async fn memory_client_with(
    ensemble: &MemoryEnsemble,
    config: ClientConfig,
) -> Client {
    Client::builder(config.endpoints.clone())
        .set_config(config)
        .connector(ensemble.connector())
        .build()
        .await
        .expect("memory client should connect")
}

pub(crate) async fn next_event(registration: &mut WatchRegistration) -> WatchEvent {
    tokio::time::timeout(RECV_TIMEOUT, registration.recv())
        .await
        .expect("watch event within timeout")
        .expect("registration still active")
}
