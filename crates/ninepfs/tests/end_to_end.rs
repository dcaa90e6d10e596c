//! End-to-end client/server scenarios against [`ninepfs::NinepFs`],
//! exercising spec.md §8's numbered scenarios over a real unix-socket
//! connection rather than calling the `Filesystem` trait directly.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use ninep::client::{Client, client_from_conn};
use ninep::dial::Dial;
use ninep::fcall::{om, P92000};
use ninep::srv::srv_conn;
use ninepfs::NinepFs;

struct TempDir(PathBuf);

impl TempDir {
    fn new() -> TempDir {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let path = std::env::temp_dir().join(format!(
            "ninepfs-e2e-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&path).unwrap();
        TempDir(path)
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

async fn serve(dir: &TempDir, readonly: bool) -> (Client<tokio::io::WriteHalf<tokio::net::UnixStream>>,) {
    let sock_path = dir.0.join(".ninep.sock");
    let dial = Dial::Unix { path: sock_path.clone() };
    let listener = dial.listen().await.unwrap();
    let fs = NinepFs::new(dir.0.clone(), readonly, "glenda", "glenda");

    tokio::spawn(async move {
        if let ninep::dial::Listener::Unix(unix, _) = listener {
            let (stream, _) = unix.accept().await.unwrap();
            let _ = srv_conn(fs, ninep::dial::Conn::Unix(stream), ninep::srv::DEFAULT_MSIZE).await;
        }
    });

    // Give the listener a moment to bind before connecting.
    tokio::task::yield_now().await;
    let client_stream = tokio::net::UnixStream::connect(&sock_path).await.unwrap();
    let client = match client_from_conn(ninep::dial::Conn::Unix(client_stream)) {
        ninep::client::ClientConn::Unix(c) => c,
        _ => unreachable!(),
    };
    (client,)
}

#[tokio::test]
async fn version_handshake_negotiates_msize() {
    let dir = TempDir::new();
    let (client,) = serve(&dir, false).await;
    let (msize, version) = client.version(4096, P92000).await.unwrap();
    assert_eq!(version, P92000);
    assert!(msize <= 4096);
}

#[tokio::test]
async fn attach_create_and_read_back_in_memory_file() {
    let dir = TempDir::new();
    let (client,) = serve(&dir, false).await;
    let (root_fid, _) = client.mount("glenda", "").await.unwrap();

    let (tmp_fid, wqids) = client.walk(root_fid, &["tmp".to_string()]).await.unwrap();
    assert_eq!(wqids.len(), 1);

    client.create(tmp_fid, "greeting", 0o644, om::RDWR).await.unwrap();
    client.pwrite(tmp_fid, 0, b"hello, 9p").await.unwrap();

    let data = client.pread(tmp_fid, 0, 9).await.unwrap();
    assert_eq!(data, b"hello, 9p");

    let stat = client.stat(tmp_fid).await.unwrap();
    assert_eq!(stat.name, "greeting");
    assert_eq!(stat.length, 9);
}

#[tokio::test]
async fn directory_listing_paginates_across_multiple_treads() {
    let dir = TempDir::new();
    let (client,) = serve(&dir, false).await;
    let (root_fid, _) = client.mount("glenda", "").await.unwrap();
    let (tmp_fid, _) = client.walk(root_fid, &["tmp".to_string()]).await.unwrap();

    for i in 0..5 {
        let (new_fid, _) = client.walk(tmp_fid, &[]).await.unwrap();
        client.create(new_fid, &format!("file-{i}"), 0o644, om::RDWR).await.unwrap();
        client.clunk(new_fid).await.unwrap();
    }

    let mut total = Vec::new();
    let mut offset = 0u64;
    loop {
        let chunk = client.read(tmp_fid, offset, 64).await.unwrap();
        if chunk.is_empty() {
            break;
        }
        offset += chunk.len() as u64;
        total.extend_from_slice(&chunk);
    }
    assert!(!total.is_empty());
}

#[tokio::test]
async fn remove_clunks_fid_so_later_ops_see_unknown_fid() {
    let dir = TempDir::new();
    let (client,) = serve(&dir, false).await;
    let (root_fid, _) = client.mount("glenda", "").await.unwrap();
    let (tmp_fid, _) = client.walk(root_fid, &["tmp".to_string()]).await.unwrap();

    client.create(tmp_fid, "doomed", 0o644, om::RDWR).await.unwrap();
    client.remove(tmp_fid).await.unwrap();

    assert!(client.stat(tmp_fid).await.is_err());
}

#[tokio::test]
async fn readonly_server_rejects_create() {
    let dir = TempDir::new();
    let (client,) = serve(&dir, true).await;
    let (root_fid, _) = client.mount("glenda", "").await.unwrap();
    let (tmp_fid, _) = client.walk(root_fid, &["tmp".to_string()]).await.unwrap();

    assert!(client.create(tmp_fid, "nope", 0o644, om::RDWR).await.is_err());
}
