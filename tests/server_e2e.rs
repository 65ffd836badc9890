use anyhow::Result;
use fsrv::client::Client;
use fsrv::config::ServerConfig;
use fsrv::logger::NoopLogger;
use fsrv::net::Server;
use fsrv::state::ServerState;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct Running {
    addr: SocketAddr,
    state: Arc<ServerState>,
    thread: JoinHandle<Result<()>>,
}

impl Running {
    fn stop(self) -> Result<()> {
        self.state.shutdown();
        self.thread.join().expect("server thread panicked")
    }
}

fn start(root: &Path, threads: usize) -> Result<Running> {
    start_with(ServerConfig {
        port: 0,
        root: root.to_path_buf(),
        threads,
        queue_capacity: threads,
        ..ServerConfig::default()
    })
}

fn start_with(config: ServerConfig) -> Result<Running> {
    let server = Server::bind(&config, Arc::new(NoopLogger))?;
    let addr = server.local_addr();
    let state = server.state();
    let thread = thread::spawn(move || server.run());
    Ok(Running { addr, state, thread })
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    let mut f = std::fs::File::create(path)?;
    f.write_all(data)?;
    Ok(())
}

#[test]
fn list_reflects_directory() -> Result<()> {
    let root = tempfile::tempdir()?;
    let srv = start(root.path(), 2)?;

    let mut client = Client::connect(srv.addr)?;
    assert!(client.list()?.is_empty());

    write_file(&root.path().join("b.txt"), b"bb")?;
    write_file(&root.path().join("a.txt"), b"a")?;
    std::fs::create_dir(root.path().join("subdir"))?;
    assert_eq!(client.list()?, vec!["a.txt", "b.txt"]);
    client.exit()?;

    srv.stop()
}

#[test]
fn download_missing_then_existing() -> Result<()> {
    let root = tempfile::tempdir()?;
    let body: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    write_file(&root.path().join("hello.bin"), &body)?;
    let srv = start(root.path(), 2)?;

    let mut client = Client::connect(srv.addr)?;
    assert_eq!(client.download("missing.bin")?, None);
    // Session survives a failed download
    assert_eq!(client.download("hello.bin")?, Some(body));
    client.exit()?;

    srv.stop()
}

#[test]
fn upload_then_overwrite() -> Result<()> {
    let root = tempfile::tempdir()?;
    let srv = start(root.path(), 2)?;

    let mut client = Client::connect(srv.addr)?;
    client.upload("up.txt", b"abcde")?;
    // No upload ack; a list answer means the upload was fully consumed
    assert_eq!(client.list()?, vec!["up.txt"]);
    assert_eq!(std::fs::read(root.path().join("up.txt"))?, b"abcde");

    client.upload("up.txt", b"xy")?;
    assert_eq!(client.download("up.txt")?, Some(b"xy".to_vec()));
    client.exit()?;

    srv.stop()
}

#[test]
fn traversal_names_are_refused() -> Result<()> {
    let outer = tempfile::tempdir()?;
    let root = outer.path().join("served");
    std::fs::create_dir(&root)?;
    write_file(&outer.path().join("secret.txt"), b"secret")?;
    let srv = start(&root, 2)?;

    let mut client = Client::connect(srv.addr)?;
    assert_eq!(client.download("../secret.txt")?, None);
    assert_eq!(client.download("/etc/passwd")?, None);
    client.exit()?;

    let mut client = Client::connect(srv.addr)?;
    client.upload("../escape.txt", b"x")?;
    // Rejected upload gets a NACK and the session closes
    assert!(client.list().is_err());
    assert!(!outer.path().join("escape.txt").exists());

    srv.stop()
}

#[test]
fn invalid_command_closes_connection() -> Result<()> {
    let root = tempfile::tempdir()?;
    let srv = start(root.path(), 1)?;

    let mut client = Client::connect(srv.addr)?;
    client.send_command(999)?;
    assert!(client.is_closed_by_server()?);
    assert!(srv.state.wait_for_idle(Duration::from_secs(5)));
    assert_eq!(srv.state.snapshot().connected, 0);

    // The single worker is free again
    let mut client = Client::connect(srv.addr)?;
    assert!(client.list()?.is_empty());
    client.exit()?;

    srv.stop()
}

#[test]
fn idle_session_is_closed_after_timeout() -> Result<()> {
    let root = tempfile::tempdir()?;
    let srv = start_with(ServerConfig {
        root: root.path().to_path_buf(),
        threads: 1,
        queue_capacity: 1,
        idle_timeout: Some(Duration::from_millis(200)),
        ..ServerConfig::default()
    })?;

    let mut client = Client::connect(srv.addr)?;
    // Say nothing and wait for the server to give up
    assert!(client.is_closed_by_server()?);
    assert!(srv.state.wait_for_idle(Duration::from_secs(5)));
    assert_eq!(srv.state.snapshot().connected, 0);

    // The worker is free for the next client
    let mut client = Client::connect(srv.addr)?;
    assert!(client.list()?.is_empty());
    client.exit()?;

    srv.stop()
}

#[test]
fn concurrent_clients_are_all_served() -> Result<()> {
    let root = tempfile::tempdir()?;
    let srv = start(root.path(), 4)?;
    let addr = srv.addr;

    let handles: Vec<_> = (0..4)
        .map(|i| {
            thread::spawn(move || -> Result<Vec<u8>> {
                let name = format!("client{}.txt", i);
                let data = format!("payload from client {}", i).into_bytes();
                let mut client = Client::connect(addr)?;
                client.upload(&name, &data)?;
                let back = client.download(&name)?.unwrap_or_default();
                client.exit()?;
                assert_eq!(back, data);
                Ok(back)
            })
        })
        .collect();
    for h in handles {
        h.join().expect("client thread panicked")?;
    }

    let mut client = Client::connect(addr)?;
    assert_eq!(client.list()?.len(), 4);
    client.exit()?;
    assert!(srv.state.wait_for_idle(Duration::from_secs(5)));

    srv.stop()
}

#[test]
fn shutdown_lets_active_session_finish() -> Result<()> {
    let root = tempfile::tempdir()?;
    write_file(&root.path().join("f.txt"), b"data")?;
    let srv = start(root.path(), 1)?;

    let mut client = Client::connect(srv.addr)?;
    assert_eq!(client.list()?, vec!["f.txt"]);

    srv.state.shutdown();
    // If the session was already blocked reading the next command it still
    // answers it; either way it ends before taking another
    if let Ok(names) = client.list() {
        assert_eq!(names, vec!["f.txt"]);
        assert!(client.is_closed_by_server()?);
    }

    srv.thread.join().expect("server thread panicked")?;
    assert!(!srv.state.is_running());
    assert!(Client::connect(srv.addr).map(|mut c| c.list().is_err()).unwrap_or(true));
    Ok(())
}
