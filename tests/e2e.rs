//! End-to-end tests through a real listener
//!
//! Most tests run against an in-process runtime whose "units" are small TCP
//! servers bound to the allocated host port. The Docker-backed tests at the
//! bottom need a local daemon and an `sshd` image:
//! cargo test --test e2e -- --ignored

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use unit_spawner::{ContainerRuntime, Error, Result, Spawner, SpawnerConfig, UnitSpec};

const BANNER: &[u8] = b"SSH-2.0-fake\r\n";

/// Runtime double: each started unit is a banner + echo server
#[derive(Default)]
struct FakeRuntime {
    units: Mutex<HashMap<String, FakeUnit>>,
    created_at: Mutex<Vec<Instant>>,
    created: AtomicUsize,
    removed: AtomicUsize,
    next_id: AtomicUsize,
    fail_create: AtomicBool,
}

struct FakeUnit {
    host_port: u16,
    server: Option<JoinHandle<()>>,
}

impl FakeRuntime {
    fn active(&self) -> usize {
        self.units.lock().len()
    }

    fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_unit(&self, spec: &UnitSpec) -> Result<String> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Runtime("pull access denied".into()));
        }
        let id = format!("fake-{:04}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.units.lock().insert(
            id.clone(),
            FakeUnit {
                host_port: spec.host_port,
                server: None,
            },
        );
        self.created_at.lock().push(Instant::now());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn start_unit(&self, id: &str) -> Result<()> {
        let port = self
            .units
            .lock()
            .get(id)
            .map(|u| u.host_port)
            .ok_or_else(|| Error::UnitNotFound(id.to_string()))?;

        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let server = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    if stream.write_all(BANNER).await.is_err() {
                        return;
                    }
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });

        if let Some(unit) = self.units.lock().get_mut(id) {
            unit.server = Some(server);
        }
        Ok(())
    }

    async fn stop_unit(&self, id: &str) -> Result<()> {
        let mut units = self.units.lock();
        let unit = units
            .get_mut(id)
            .ok_or_else(|| Error::UnitNotFound(id.to_string()))?;
        match unit.server.take() {
            Some(server) => {
                server.abort();
                Ok(())
            }
            None => Err(Error::UnitNotFound(id.to_string())),
        }
    }

    async fn remove_unit(&self, id: &str) -> Result<()> {
        match self.units.lock().remove(id) {
            Some(_) => {
                self.removed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(Error::UnitNotFound(id.to_string())),
        }
    }
}

fn config() -> unit_spawner::config::SpawnerConfigBuilder {
    SpawnerConfig::builder()
        .image("sshd")
        .host("127.0.0.1")
        .listen_port(0)
        .container_port("22/tcp")
}

async fn eventually(limit: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

async fn read_banner(stream: &mut TcpStream) {
    let mut buf = vec![0u8; BANNER.len()];
    tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut buf))
        .await
        .expect("banner timed out")
        .unwrap();
    assert_eq!(buf, BANNER);
}

#[tokio::test]
async fn test_connection_creates_and_removes_one_unit() {
    let runtime = Arc::new(FakeRuntime::default());
    let spawner = Spawner::new(config().build().unwrap(), runtime.clone()).unwrap();
    let handle = spawner.start().await.unwrap();

    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
    assert!(eventually(Duration::from_millis(1200), || runtime.active() == 1).await);

    read_banner(&mut client).await;
    client.write_all(b"id\n").await.unwrap();
    let mut echo = [0u8; 3];
    client.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"id\n");

    drop(client);
    assert!(eventually(Duration::from_millis(1200), || runtime.active() == 0).await);
    assert_eq!(runtime.created(), 1);
    assert_eq!(runtime.removed(), 1);
    assert_eq!(spawner.active_units(), 0);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_port_scan_leaves_no_units() {
    let runtime = Arc::new(FakeRuntime::default());
    let spawner = Spawner::new(config().build().unwrap(), runtime.clone()).unwrap();
    let handle = spawner.start().await.unwrap();

    for _ in 0..4 {
        let client = TcpStream::connect(handle.local_addr()).await.unwrap();
        drop(client);
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(eventually(Duration::from_secs(2), || runtime.active() == 0).await);
    assert_eq!(runtime.created(), runtime.removed());
    assert_eq!(spawner.active_units(), 0);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_rate_limit_spaces_session_starts() {
    let interval = Duration::from_millis(300);
    let runtime = Arc::new(FakeRuntime::default());
    let config = config().rate_limit_ms(300).settle_delay_ms(0).build().unwrap();
    let spawner = Spawner::new(config, runtime.clone()).unwrap();
    let handle = spawner.start().await.unwrap();

    let before = Instant::now();
    let mut first = TcpStream::connect(handle.local_addr()).await.unwrap();
    let mut second = TcpStream::connect(handle.local_addr()).await.unwrap();

    read_banner(&mut first).await;
    read_banner(&mut second).await;

    let created_at = runtime.created_at.lock().clone();
    assert_eq!(created_at.len(), 2);
    assert!(created_at[1] >= before + interval);

    drop(first);
    drop(second);
    assert!(eventually(Duration::from_secs(2), || runtime.active() == 0).await);
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_leaving_while_rate_limited_gets_no_unit() {
    let runtime = Arc::new(FakeRuntime::default());
    let config = config().rate_limit_ms(1000).settle_delay_ms(0).build().unwrap();
    let spawner = Spawner::new(config, runtime.clone()).unwrap();
    let handle = spawner.start().await.unwrap();

    let mut first = TcpStream::connect(handle.local_addr()).await.unwrap();
    read_banner(&mut first).await;
    assert_eq!(runtime.created(), 1);

    // held for ~1s by the limiter, then gone before it is admitted
    let second = TcpStream::connect(handle.local_addr()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(second);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(runtime.created(), 1);
    assert_eq!(runtime.active(), 1);

    drop(first);
    assert!(eventually(Duration::from_secs(2), || runtime.active() == 0).await);
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_sending_banner_then_leaving_gets_no_unit() {
    let runtime = Arc::new(FakeRuntime::default());
    let config = config().rate_limit_ms(1000).settle_delay_ms(0).build().unwrap();
    let spawner = Spawner::new(config, runtime.clone()).unwrap();
    let handle = spawner.start().await.unwrap();

    let mut first = TcpStream::connect(handle.local_addr()).await.unwrap();
    read_banner(&mut first).await;

    // ssh clients speak first, so the close arrives behind unread bytes
    let mut second = TcpStream::connect(handle.local_addr()).await.unwrap();
    second.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(second);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(runtime.created(), 1);

    drop(first);
    assert!(eventually(Duration::from_secs(2), || runtime.active() == 0).await);
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_session_timeout_forces_teardown() {
    let runtime = Arc::new(FakeRuntime::default());
    let config = config().session_timeout_ms(300).settle_delay_ms(0).build().unwrap();
    let spawner = Spawner::new(config, runtime.clone()).unwrap();
    let handle = spawner.start().await.unwrap();

    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
    read_banner(&mut client).await;
    let connected = Instant::now();

    // neither side closes; the timeout must end the session
    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(3), client.read_to_end(&mut rest)).await;
    assert!(read.is_ok(), "session was not ended by the timeout");
    assert!(connected.elapsed() < Duration::from_secs(2));

    assert!(eventually(Duration::from_secs(2), || runtime.active() == 0).await);
    assert_eq!(runtime.removed(), 1);
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_provision_drops_client_without_data() {
    let runtime = Arc::new(FakeRuntime::default());
    runtime.fail_create.store(true, Ordering::SeqCst);
    let spawner = Spawner::new(config().build().unwrap(), runtime.clone()).unwrap();
    let handle = spawner.start().await.unwrap();

    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut buf))
        .await
        .expect("connection was not dropped");
    // closed or reset, either way nothing was sent
    if read.is_ok() {
        assert!(buf.is_empty());
    }
    assert_eq!(runtime.active(), 0);
    assert_eq!(spawner.active_units(), 0);

    // the listener survives a failed session
    runtime.fail_create.store(false, Ordering::SeqCst);
    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
    read_banner(&mut client).await;
    drop(client);
    assert!(eventually(Duration::from_secs(2), || runtime.active() == 0).await);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_reuse_keeps_unit_warm_for_same_client() {
    let runtime = Arc::new(FakeRuntime::default());
    let config = config()
        .reuse(true)
        .idle_timeout_ms(60_000)
        .settle_delay_ms(0)
        .build()
        .unwrap();
    let spawner = Spawner::new(config, runtime.clone()).unwrap();
    let handle = spawner.start().await.unwrap();

    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
    read_banner(&mut client).await;
    drop(client);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(runtime.active(), 1, "unit should stay parked");

    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
    read_banner(&mut client).await;
    assert_eq!(runtime.created(), 1, "second session should reuse the warm unit");
    drop(client);

    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.stop().await.unwrap();
    assert_eq!(runtime.active(), 0);
    assert_eq!(runtime.removed(), 1);
}

#[tokio::test]
async fn test_reuse_idle_unit_expires() {
    let runtime = Arc::new(FakeRuntime::default());
    let config = config()
        .reuse(true)
        .idle_timeout_ms(200)
        .settle_delay_ms(0)
        .build()
        .unwrap();
    let spawner = Spawner::new(config, runtime.clone()).unwrap();
    let handle = spawner.start().await.unwrap();

    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
    read_banner(&mut client).await;
    drop(client);

    assert!(eventually(Duration::from_secs(2), || runtime.active() == 0).await);
    assert_eq!(runtime.removed(), 1);
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_lets_sessions_drain() {
    let runtime = Arc::new(FakeRuntime::default());
    let config = config().settle_delay_ms(0).build().unwrap();
    let spawner = Spawner::new(config, runtime.clone()).unwrap();
    let handle = spawner.start().await.unwrap();
    let addr = handle.local_addr();

    let mut client = TcpStream::connect(addr).await.unwrap();
    read_banner(&mut client).await;

    handle.stop().await.unwrap();
    assert!(TcpStream::connect(addr).await.is_err());

    // the in-flight session still relays
    client.write_all(b"ls\n").await.unwrap();
    let mut echo = [0u8; 3];
    client.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"ls\n");

    drop(client);
    assert!(eventually(Duration::from_secs(2), || runtime.active() == 0).await);
}

#[test]
fn test_shutdown_decommissions_in_flight_units_before_runtime_exits() {
    let runtime = Arc::new(FakeRuntime::default());
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    rt.block_on(async {
        let config = config().settle_delay_ms(0).build().unwrap();
        let spawner = Spawner::new(config, runtime.clone()).unwrap();
        let handle = spawner.start().await.unwrap();

        // stays connected past the grace period
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        read_banner(&mut client).await;

        handle.shutdown(Duration::from_millis(200)).await.unwrap();
        assert_eq!(spawner.active_units(), 0);
        drop(client);
    });
    drop(rt);

    assert_eq!(runtime.created(), 1);
    assert_eq!(runtime.removed(), 1);
    assert_eq!(runtime.active(), 0);
}

#[tokio::test]
async fn test_shutdown_waits_for_sessions_within_grace() {
    let runtime = Arc::new(FakeRuntime::default());
    let config = config().settle_delay_ms(0).build().unwrap();
    let spawner = Spawner::new(config, runtime.clone()).unwrap();
    let handle = spawner.start().await.unwrap();

    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
    read_banner(&mut client).await;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(client);
    });

    let started = Instant::now();
    handle.shutdown(Duration::from_secs(10)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(runtime.removed(), 1);
    assert_eq!(runtime.active(), 0);
}

#[tokio::test]
async fn test_concurrent_clients_get_distinct_units() {
    let runtime = Arc::new(FakeRuntime::default());
    let config = config().settle_delay_ms(0).build().unwrap();
    let spawner = Spawner::new(config, runtime.clone()).unwrap();
    let handle = spawner.start().await.unwrap();

    let mut clients = Vec::new();
    for _ in 0..5 {
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        read_banner(&mut client).await;
        clients.push(client);
    }
    assert_eq!(runtime.active(), 5);

    let ports: std::collections::HashSet<u16> =
        runtime.units.lock().values().map(|u| u.host_port).collect();
    assert_eq!(ports.len(), 5);

    drop(clients);
    assert!(eventually(Duration::from_secs(2), || runtime.active() == 0).await);
    handle.stop().await.unwrap();
}

mod docker {
    use super::*;
    use unit_spawner::DockerRuntime;

    fn docker_config(port: u16) -> SpawnerConfig {
        SpawnerConfig::builder()
            .image(std::env::var("SPAWNER_TEST_IMAGE").unwrap_or_else(|_| "sshd".into()))
            .host("127.0.0.1")
            .listen_port(port)
            .container_port("22/tcp")
            .build()
            .unwrap()
    }

    fn runtime() -> Arc<DockerRuntime> {
        Arc::new(DockerRuntime::connect(unit_spawner::config::DEFAULT_DOCKER_SOCKET).unwrap())
    }

    #[tokio::test]
    #[ignore] // Run manually: cargo test --test e2e -- --ignored
    async fn test_connection_creates_container() {
        let docker = runtime();
        let baseline = docker.count_units().await.unwrap();

        let spawner = Spawner::new(docker_config(1337), docker.clone()).unwrap();
        let handle = spawner.start().await.unwrap();

        let client = TcpStream::connect(handle.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(docker.count_units().await.unwrap(), baseline + 1);

        drop(client);
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(docker.count_units().await.unwrap(), baseline);

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_port_scan_leaks_no_containers() {
        let docker = runtime();
        let baseline = docker.count_units().await.unwrap();

        let spawner = Spawner::new(docker_config(1338), docker.clone()).unwrap();
        let handle = spawner.start().await.unwrap();

        for _ in 0..4 {
            drop(TcpStream::connect(handle.local_addr()).await.unwrap());
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(docker.count_units().await.unwrap(), baseline);

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_ssh_banner_through_proxy() {
        let spawner = Spawner::new(docker_config(1339), runtime()).unwrap();
        let handle = spawner.start().await.unwrap();

        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut banner = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(10), client.read_exact(&mut banner))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&banner, b"SSH-");

        drop(client);
        handle.stop().await.unwrap();
    }
}
