//! End-to-end tests for the lifecycle coordinator

use slsrelay::config::CustomServerEntry;
use slsrelay::diagnostics::{PortConflictDiagnostics, TableFormat};
use slsrelay::modules::ModulePreloader;
use slsrelay::relay::RelaySettings;
use slsrelay::serverlist::{FileServerList, ServerInfo, ServerMap};
use slsrelay::{
    HostsOverride, LifecycleCoordinator, LifecycleState, RegionDescriptor, ShutdownCoordinator,
    StartupError,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};

const HOSTNAME: &str = "sls.service.enmasse.com";
const HOSTS_CONTENT: &str = "127.0.0.1 localhost\n";

/// Game server double that echoes every byte back
async fn spawn_game_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

fn region(list_port: u16) -> RegionDescriptor {
    let mut custom_servers = BTreeMap::new();
    custom_servers.insert("1".to_string(), CustomServerEntry { ip: None, port: 0 });
    RegionDescriptor {
        code: "NA".into(),
        url: Some(format!("http://{}:8080/servers/list.en", HOSTNAME)),
        paths: vec![],
        hostname: HOSTNAME.into(),
        port: list_port,
        listen_hostname: "127.0.0.1".parse().unwrap(),
        custom_servers,
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    hosts_path: std::path::PathBuf,
    coordinator: LifecycleCoordinator<FileServerList>,
}

fn harness(region: RegionDescriptor, upstream: ServerMap, hosts_content: &str) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let hosts_path = dir.path().join("hosts");
    std::fs::write(&hosts_path, hosts_content).unwrap();
    let modules_dir = dir.path().join("modules");
    std::fs::create_dir(&modules_dir).unwrap();

    let source = FileServerList::from_map(region.clone(), upstream);
    let coordinator = LifecycleCoordinator::new(
        region,
        source,
        HostsOverride::new(&hosts_path),
        ModulePreloader::new(&modules_dir),
        RelaySettings::default(),
    );

    Harness {
        _dir: dir,
        hosts_path,
        coordinator,
    }
}

#[tokio::test]
async fn test_end_to_end_relay() {
    let game = spawn_game_server().await;

    let mut upstream = ServerMap::new();
    upstream.insert("1".into(), ServerInfo::new("127.0.0.1", game.port()));
    let mut other = ServerInfo::new("10.0.0.2", 7802);
    other.extra.insert("name".into(), "Mount Tyrannas".into());
    upstream.insert("2".into(), other);

    let Harness {
        _dir,
        hosts_path,
        mut coordinator,
    } = harness(region(0), upstream, HOSTS_CONTENT);

    coordinator.start().await.unwrap();
    assert_eq!(coordinator.state(), LifecycleState::Running);

    let hosts = HostsOverride::new(&hosts_path);
    let ip = "127.0.0.1".parse().unwrap();
    assert!(hosts.contains(ip, HOSTNAME).unwrap());

    // The served list points "1" at its relay and leaves "2" alone
    let list_addr = coordinator.source().local_addr().unwrap();
    let served: serde_json::Value = reqwest::get(format!("http://{}/servers/list.en", list_addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(served["1"]["ip"], "127.0.0.1");
    assert_eq!(served["2"]["ip"], "10.0.0.2");
    assert_eq!(served["2"]["name"], "Mount Tyrannas");

    let relays = coordinator.relays().unwrap();
    assert_eq!(relays.len(), 1);
    let relay_addr = relays.get("1").unwrap().local_addr().unwrap();

    let payload: Vec<u8> = (0u8..=255).cycle().take(64 * 1024).collect();
    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    client.write_all(&payload).await.unwrap();
    let mut received = vec![0u8; payload.len()];
    timeout(Duration::from_secs(5), client.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, payload);
    drop(client);

    let shutdown = ShutdownCoordinator::new(Duration::from_secs(2));
    coordinator.terminate(&shutdown).await;
    assert_eq!(coordinator.state(), LifecycleState::Terminated);
    assert_eq!(std::fs::read_to_string(&hosts_path).unwrap(), HOSTS_CONTENT);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(relay_addr).await.is_err());
    assert!(TcpStream::connect(list_addr).await.is_err());

    // Repeated shutdown is a no-op
    coordinator.terminate(&shutdown).await;
    assert_eq!(coordinator.state(), LifecycleState::Terminated);
}

#[tokio::test]
async fn test_list_port_conflict() {
    let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = held.local_addr().unwrap().port();

    let mut upstream = ServerMap::new();
    upstream.insert("1".into(), ServerInfo::new("127.0.0.1", 7801));

    // A record left behind by an unclean exit is cleared first
    let stale = format!("{}127.0.0.1 {}\n", HOSTS_CONTENT, HOSTNAME);
    let Harness {
        _dir,
        hosts_path,
        mut coordinator,
    } = harness(region(port), upstream, &stale);

    let err = coordinator.start().await.unwrap_err();
    assert!(matches!(err, StartupError::PortConflict { port: p } if p == port));
    assert_eq!(coordinator.state(), LifecycleState::FetchFailed);
    assert!(coordinator.relays().is_none());
    assert_eq!(std::fs::read_to_string(&hosts_path).unwrap(), HOSTS_CONTENT);

    let diagnostics = PortConflictDiagnostics::with_command(
        "slsrelay-missing-netstat",
        vec![],
        TableFormat::Unix,
    );
    assert_eq!(err.report(&diagnostics).await, 1);
}

#[tokio::test]
async fn test_unknown_custom_server_is_skipped() {
    let game = spawn_game_server().await;
    let mut upstream = ServerMap::new();
    upstream.insert("7".into(), ServerInfo::new("127.0.0.1", game.port()));

    let Harness {
        _dir,
        mut coordinator,
        ..
    } = harness(region(0), upstream, HOSTS_CONTENT);

    coordinator.start().await.unwrap();
    let relays = coordinator.relays().unwrap();
    assert!(relays.is_empty());
    assert_eq!(relays.skipped(), &["1".to_string()]);

    coordinator.shutdown();
    assert_eq!(coordinator.state(), LifecycleState::ShuttingDown);
}

#[cfg(unix)]
#[tokio::test]
async fn test_unremovable_stale_record_stops_startup() {
    let mut upstream = ServerMap::new();
    upstream.insert("1".into(), ServerInfo::new("127.0.0.1", 7801));

    let Harness {
        _dir,
        hosts_path,
        mut coordinator,
    } = harness(region(0), upstream, HOSTS_CONTENT);

    // A directory in place of the hosts file fails with a plain I/O error
    std::fs::remove_file(&hosts_path).unwrap();
    std::fs::create_dir(&hosts_path).unwrap();

    let err = coordinator.start().await.unwrap_err();
    assert!(matches!(err, StartupError::StaleOverride { .. }));
    assert_eq!(coordinator.state(), LifecycleState::Idle);
    assert!(coordinator.source().local_addr().is_none());
    assert!(coordinator.relays().is_none());
}
