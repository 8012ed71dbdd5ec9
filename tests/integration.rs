//! End-to-end tests: real listen sockets, mocked remote side.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use wakegate::config::{Config, HostConfig, HostDefaults, Protocol, ProxyConfig, ServerConfig};
use wakegate::controller::{HostController, HostHandle};
use wakegate::host::Host;
use wakegate::registry::HostRegistry;
use wakegate::remote::{CommandRunner, Pinger};
use wakegate::state::HostState;
use wakegate::tcp::TcpProxy;

/// Counts issued commands; never fails.
struct CountingRunner {
    commands: AtomicUsize,
}

impl CountingRunner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            commands: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl CommandRunner for CountingRunner {
    async fn run_remote_command(&self, _host: &HostConfig, _command: &str) -> anyhow::Result<()> {
        self.commands.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct SwitchPinger {
    up: AtomicBool,
}

impl SwitchPinger {
    fn new(up: bool) -> Arc<Self> {
        Arc::new(Self {
            up: AtomicBool::new(up),
        })
    }
}

#[async_trait]
impl Pinger for SwitchPinger {
    async fn ping(&self, _host: &HostConfig, _timeout: Duration) -> anyhow::Result<bool> {
        Ok(self.up.load(Ordering::SeqCst))
    }
}

fn host_config(name: &str, proxies: Vec<ProxyConfig>) -> HostConfig {
    HostConfig {
        name: name.to_string(),
        ip: "127.0.0.1".to_string(),
        mac_address: None,
        ssh_username: "admin".to_string(),
        ssh_password: Some("secret".to_string()),
        ssh_key_path: None,
        ssh_port: 22,
        autostop: false,
        max_alive_secs: None,
        start_command: Some("virsh start guest".to_string()),
        stop_command: None,
        docker_port: None,
        proxies,
    }
}

fn tcp_proxy_config(name: &str, target_port: u16) -> ProxyConfig {
    ProxyConfig {
        name: name.to_string(),
        listen_port: 0,
        target_port,
        protocol: Protocol::Tcp,
    }
}

fn fast_defaults() -> HostDefaults {
    HostDefaults {
        wake_timeout_secs: 1,
        ping_timeout_ms: 10,
        ping_interval_ms: 10,
        peek_timeout_ms: 100,
        ..HostDefaults::default()
    }
}

fn controller_with(
    runner: Arc<dyn CommandRunner>,
    pinger: Arc<dyn Pinger>,
) -> Arc<HostController> {
    HostController::new(
        Arc::new(RwLock::new(host_config("guest", vec![]))),
        fast_defaults(),
        runner,
        pinger,
    )
}

async fn start_proxy(host: Arc<dyn HostHandle>, target_port: u16) -> Arc<TcpProxy> {
    let proxy = Arc::new(
        TcpProxy::new(
            &tcp_proxy_config("svc", target_port),
            "127.0.0.1",
            host,
            &fast_defaults(),
        )
        .await
        .unwrap(),
    );
    proxy.start().await.unwrap();
    proxy
}

/// Upstream that echoes everything it reads, one task per connection.
async fn spawn_echo_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    port
}

#[tokio::test]
async fn test_connection_wakes_host_and_forwards_bytes() {
    let upstream_port = spawn_echo_upstream().await;
    let runner = CountingRunner::new();
    let controller = controller_with(runner.clone(), SwitchPinger::new(true));
    let proxy = start_proxy(controller.clone(), upstream_port).await;

    let addr = proxy.local_addr().unwrap();
    let mut client = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
    client.write_all(b"hello").await.unwrap();

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(3), client.read(&mut buf))
        .await
        .expect("echo expected")
        .unwrap();
    assert_eq!(&buf[..n], b"hello");

    assert_eq!(controller.state(), HostState::Started);
    assert_eq!(runner.commands.load(Ordering::SeqCst), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn test_status_probe_never_wakes_a_stopped_host() {
    let upstream_port = spawn_echo_upstream().await;
    let runner = CountingRunner::new();
    let controller = controller_with(runner.clone(), SwitchPinger::new(true));
    let proxy = start_proxy(controller.clone(), upstream_port).await;

    let addr = proxy.local_addr().unwrap();
    let mut client = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: guest\r\nStatus: true\r\n\r\n")
        .await
        .unwrap();

    // The proxy closes without forwarding anything
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("close expected")
        .unwrap();
    assert_eq!(n, 0);

    assert_eq!(controller.state(), HostState::Stopped);
    assert_eq!(runner.commands.load(Ordering::SeqCst), 0);

    proxy.stop().await;
}

#[tokio::test]
async fn test_concurrent_connections_coalesce_to_one_start() {
    let upstream_port = spawn_echo_upstream().await;
    let runner = CountingRunner::new();
    let pinger = SwitchPinger::new(false);
    let controller = controller_with(runner.clone(), pinger.clone());
    let proxy = start_proxy(controller.clone(), upstream_port).await;
    let port = proxy.local_addr().unwrap().port();

    // The host "boots" 200ms after the first start command
    {
        let pinger = pinger.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            pinger.up.store(true, Ordering::SeqCst);
        });
    }

    let mut tasks = Vec::new();
    for i in 0..8u8 {
        tasks.push(tokio::spawn(async move {
            let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let msg = [b'a' + i; 4];
            client.write_all(&msg).await.unwrap();
            let mut buf = [0u8; 8];
            let n = tokio::time::timeout(Duration::from_secs(3), client.read(&mut buf))
                .await
                .expect("echo expected")
                .unwrap();
            assert_eq!(&buf[..n], &msg);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(runner.commands.load(Ordering::SeqCst), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn test_unreachable_host_closes_connection_without_upstream_contact() {
    // Upstream that records whether anyone ever connected
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = listener.local_addr().unwrap().port();
    let contacted = Arc::new(AtomicBool::new(false));
    {
        let contacted = contacted.clone();
        tokio::spawn(async move {
            if listener.accept().await.is_ok() {
                contacted.store(true, Ordering::SeqCst);
            }
        });
    }

    let controller = controller_with(CountingRunner::new(), SwitchPinger::new(false));
    let proxy = start_proxy(controller.clone(), upstream_port).await;

    let addr = proxy.local_addr().unwrap();
    let mut client = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
    client.write_all(b"data").await.unwrap();

    // Connection is closed once the wake attempt gives up
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("close expected")
        .unwrap();
    assert_eq!(n, 0);

    assert_eq!(controller.state(), HostState::Stopped);
    assert!(
        !contacted.load(Ordering::SeqCst),
        "upstream must stay untouched"
    );

    proxy.stop().await;
}

#[tokio::test]
async fn test_peeked_bytes_arrive_upstream_once_and_in_order() {
    // Upstream that collects everything until EOF
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = listener.local_addr().unwrap().port();
    let (tx, rx) = tokio::sync::oneshot::channel::<Vec<u8>>();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut collected = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        let _ = tx.send(collected);
    });

    let controller = controller_with(CountingRunner::new(), SwitchPinger::new(true));
    let proxy = start_proxy(controller, upstream_port).await;
    let addr = proxy.local_addr().unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
    client.write_all(b"hello").await.unwrap();
    // Later bytes must land after the peeked prefix, never before
    tokio::time::sleep(Duration::from_millis(300)).await;
    client.write_all(b" world").await.unwrap();
    client.shutdown().await.unwrap();

    let collected = tokio::time::timeout(Duration::from_secs(3), rx)
        .await
        .expect("upstream must see the stream")
        .unwrap();
    assert_eq!(collected, b"hello world");

    proxy.stop().await;
}

#[tokio::test]
async fn test_server_talks_first_protocol_is_forwarded() {
    // Upstream sends a banner without waiting for client bytes
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let _ = stream.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await;
        }
    });

    let runner = CountingRunner::new();
    let controller = controller_with(runner.clone(), SwitchPinger::new(true));
    let proxy = start_proxy(controller, upstream_port).await;
    let addr = proxy.local_addr().unwrap();

    // The client sends nothing; the peek deadline expires and the wake
    // still happens
    let mut client = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(3), client.read(&mut buf))
        .await
        .expect("banner expected")
        .unwrap();
    assert!(buf[..n].starts_with(b"SSH-2.0"));
    assert_eq!(runner.commands.load(Ordering::SeqCst), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn test_upstream_close_propagates_to_client() {
    // Upstream that closes immediately after one reply
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(b"bye").await;
        }
    });

    let controller = controller_with(CountingRunner::new(), SwitchPinger::new(true));
    let proxy = start_proxy(controller, upstream_port).await;
    let addr = proxy.local_addr().unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
    client.write_all(b"hi").await.unwrap();

    let mut collected = Vec::new();
    let mut buf = [0u8; 16];
    loop {
        let n = tokio::time::timeout(Duration::from_secs(3), client.read(&mut buf))
            .await
            .expect("close expected")
            .unwrap();
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
    }
    assert_eq!(collected, b"bye");

    proxy.stop().await;
}

#[tokio::test]
async fn test_stop_force_closes_open_splices() {
    // Upstream that accepts and then sits silent forever
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let controller = controller_with(CountingRunner::new(), SwitchPinger::new(true));
    let proxy = start_proxy(controller, upstream_port).await;
    let addr = proxy.local_addr().unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
    client.write_all(b"hold").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(proxy.active_connections(), 1);

    // stop() must cut through the idle splice and return
    tokio::time::timeout(Duration::from_secs(3), proxy.stop())
        .await
        .expect("stop must not hang");
    assert_eq!(proxy.active_connections(), 0);

    // The client side observes the close
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("close expected")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_reconcile_replaces_hosts_without_disturbing_survivors() {
    let registry = HostRegistry::new(CountingRunner::new(), SwitchPinger::new(true));

    let config = Config {
        server: ServerConfig::default(),
        defaults: fast_defaults(),
        hosts: vec![
            host_config("a", vec![tcp_proxy_config("svc", 22)]),
            host_config("b", vec![tcp_proxy_config("svc", 22)]),
        ],
    };
    let result = registry.apply_config(&config).await;
    assert_eq!(result.created, vec!["a".to_string(), "b".to_string()]);

    let a_port = registry
        .get("a")
        .unwrap()
        .tcp_proxy("svc")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let b_addr = registry
        .get("b")
        .unwrap()
        .tcp_proxy("svc")
        .unwrap()
        .local_addr()
        .unwrap();

    let next = Config {
        server: ServerConfig::default(),
        defaults: fast_defaults(),
        hosts: vec![
            host_config("b", vec![tcp_proxy_config("svc", 22)]),
            host_config("c", vec![tcp_proxy_config("svc", 22)]),
        ],
    };
    let result = registry.apply_config(&next).await;
    assert_eq!(result.removed, vec!["a".to_string()]);
    assert_eq!(result.updated, vec!["b".to_string()]);
    assert_eq!(result.created, vec!["c".to_string()]);

    // a is gone and its port is free again
    assert!(registry.get("a").is_none());
    assert!(TcpListener::bind(("0.0.0.0", a_port)).await.is_ok());

    // b kept its listen socket across the reload
    let b_addr_after = registry
        .get("b")
        .unwrap()
        .tcp_proxy("svc")
        .unwrap()
        .local_addr()
        .unwrap();
    assert_eq!(b_addr, b_addr_after);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_host_aggregate_serves_traffic_end_to_end() {
    let upstream_port = spawn_echo_upstream().await;
    let runner = CountingRunner::new();

    let host = Host::start(
        host_config("guest", vec![tcp_proxy_config("svc", upstream_port)]),
        &fast_defaults(),
        runner.clone(),
        SwitchPinger::new(true),
    )
    .await
    .unwrap();

    let addr = host.tcp_proxy("svc").unwrap().local_addr().unwrap();
    let mut client = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
    client.write_all(b"ping").await.unwrap();

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(3), client.read(&mut buf))
        .await
        .expect("echo expected")
        .unwrap();
    assert_eq!(&buf[..n], b"ping");
    assert_eq!(host.state(), HostState::Started);

    drop(client);
    host.stop().await;
}
