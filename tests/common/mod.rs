use std::time::Duration;

use d_coord::Client;
use d_coord::ClientConfig;
use d_coord::MemoryEnsemble;
use d_coord::RetryPolicy;
use d_coord::Server;
use d_coord::ServerSettings;
use d_coord::WatchEvent;
use d_coord::WatchRegistration;
use tokio::sync::watch;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Reference service listening on an ephemeral local port
pub struct TestService {
    pub addr: String,
    pub ensemble: MemoryEnsemble,
    _shutdown: watch::Sender<()>,
}

pub async fn start_service() -> TestService {
    let settings = ServerSettings {
        listen_addr: "127.0.0.1:0".to_string(),
        metrics_port: 0,
        reaper_interval_ms: 50,
        ..ServerSettings::default()
    };
    let server = Server::bind(settings, MemoryEnsemble::default())
        .await
        .expect("bind ephemeral port");
    let addr = server.local_addr().expect("local addr").to_string();
    let ensemble = server.ensemble().clone();
    let (shutdown, shutdown_rx) = watch::channel(());
    tokio::spawn(server.serve(shutdown_rx));

    TestService {
        addr,
        ensemble,
        _shutdown: shutdown,
    }
}

pub fn client_config(addr: &str) -> ClientConfig {
    ClientConfig {
        endpoints: vec![addr.to_string()],
        session_timeout_ms: 2000,
        connect_timeout_ms: 500,
        request_timeout_ms: 3000,
        retry: RetryPolicy::fixed(10, Duration::from_millis(50)),
    }
}

/// Client speaking the TCP wire protocol to `service`
pub async fn connect(service: &TestService) -> Client {
    Client::connect(client_config(&service.addr))
        .await
        .expect("client should connect over tcp")
}

pub async fn next_event(registration: &mut WatchRegistration) -> WatchEvent {
    tokio::time::timeout(RECV_TIMEOUT, registration.recv())
        .await
        .expect("watch event within timeout")
        .expect("registration still active")
}
