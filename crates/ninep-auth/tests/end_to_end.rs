//! End-to-end scenarios against [`ninep_auth::AuthFs`] over a real
//! unix-socket connection, covering spec.md §8's auth scenarios (5 and
//! 6) plus the `/ctl`/`/key` register-then-audit path.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ninep::client::{client_from_conn, Client};
use ninep::dial::Dial;
use ninep::fcall::om;
use ninep::srv::srv_conn;

use ninep_auth::core::{AuthProto, Key, KeyRing};
use ninep_auth::crypto::{ed25519, fido2::MockFido2};
use ninep_auth::{AuthFs, Engine};

struct TempDir(PathBuf);

impl TempDir {
    fn new() -> TempDir {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let path = std::env::temp_dir().join(format!(
            "ninep-auth-e2e-{}-{}",
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

async fn serve(dir: &TempDir, ring: KeyRing) -> Client<tokio::io::WriteHalf<tokio::net::UnixStream>> {
    let sock_path = dir.0.join(".auth.sock");
    let dial = Dial::Unix { path: sock_path.clone() };
    let listener = dial.listen().await.unwrap();
    let engine = Arc::new(Engine::new(ring, None, Arc::new(MockFido2)));
    let auth_fs = AuthFs::new(engine, "auth", "auth");

    tokio::spawn(async move {
        if let ninep::dial::Listener::Unix(unix, _) = listener {
            let (stream, _) = unix.accept().await.unwrap();
            let _ = srv_conn(auth_fs, ninep::dial::Conn::Unix(stream), ninep::srv::DEFAULT_MSIZE).await;
        }
    });

    tokio::task::yield_now().await;
    let client_stream = tokio::net::UnixStream::connect(&sock_path).await.unwrap();
    match client_from_conn(ninep::dial::Conn::Unix(client_stream)) {
        ninep::client::ClientConn::Unix(c) => c,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn ed25519_server_client_round_trip_over_the_wire() {
    let dir = TempDir::new();
    let (public_key, private_key) = ed25519::generate_keypair();
    let mut ring = KeyRing::new();
    ring.add(Key {
        proto: AuthProto::Ed25519,
        user: "alice".into(),
        auth_id: "example.com".into(),
        credential_id: Vec::new(),
        public_key: public_key.to_vec(),
        private_key: Some(private_key),
    })
    .unwrap();

    let client = serve(&dir, ring).await;

    // Root fid stays 0; two independent /rpc fids play the server and
    // client roles, as spec.md §8 scenario 5 describes ("a parallel
    // fid").
    let (root_fid, _) = client.mount("tester", "").await.unwrap();

    let (server_fid, _) = client.walk(root_fid, &["rpc".to_string()]).await.unwrap();
    client.open(server_fid, om::RDWR).await.unwrap();
    client
        .write(server_fid, 0, b"start user=alice auth-id=example.com proto=ed25519 role=server")
        .await
        .unwrap();
    let challenge = client.read(server_fid, 0, 64).await.unwrap();
    assert_eq!(challenge.len(), 36);

    let (client_fid, _) = client.walk(root_fid, &["rpc".to_string()]).await.unwrap();
    client.open(client_fid, om::RDWR).await.unwrap();
    client
        .write(client_fid, 0, b"start user=alice auth-id=example.com proto=ed25519 role=client")
        .await
        .unwrap();
    client.write(client_fid, 0, &challenge).await.unwrap();
    let blob = client.read(client_fid, 0, 256).await.unwrap();

    client.write(server_fid, 0, &blob).await.unwrap();
    let done = client.read(server_fid, 0, 64).await.unwrap();
    assert_eq!(done, b"done");
}

#[tokio::test]
async fn conversation_expires_after_ten_seconds() {
    let dir = TempDir::new();
    let client = serve(&dir, KeyRing::new()).await;
    let (root_fid, _) = client.mount("tester", "").await.unwrap();
    let (fid, _) = client.walk(root_fid, &["rpc".to_string()]).await.unwrap();
    client.open(fid, om::RDWR).await.unwrap();

    client.write(fid, 0, b"start user=alice auth-id=example.com proto=ed25519 role=server").await.unwrap();

    tokio::time::sleep(std::time::Duration::from_secs(11)).await;

    let result = client.read(fid, 0, 64).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn register_via_ctl_then_audit_via_key() {
    let dir = TempDir::new();
    let client = serve(&dir, KeyRing::new()).await;
    let (root_fid, _) = client.mount("tester", "").await.unwrap();

    let (ctl_fid, _) = client.walk(root_fid, &["ctl".to_string()]).await.unwrap();
    client.open(ctl_fid, om::WRITE).await.unwrap();
    let pubkey_hex = hex::encode([3u8; 32]);
    client
        .write(ctl_fid, 0, format!("register user=bob auth-id=phone proto=ed25519 pubkey={pubkey_hex}").as_bytes())
        .await
        .unwrap();

    let (key_fid, _) = client.walk(root_fid, &["key".to_string()]).await.unwrap();
    client.open(key_fid, om::READ).await.unwrap();
    let data = client.read(key_fid, 0, 4096).await.unwrap();
    let text = String::from_utf8(data).unwrap();
    assert!(text.contains("bob phone"));
}

#[tokio::test]
async fn log_records_ctl_activity() {
    let dir = TempDir::new();
    let client = serve(&dir, KeyRing::new()).await;
    let (root_fid, _) = client.mount("tester", "").await.unwrap();

    let (ctl_fid, _) = client.walk(root_fid, &["ctl".to_string()]).await.unwrap();
    client.open(ctl_fid, om::WRITE).await.unwrap();
    let pubkey_hex = hex::encode([5u8; 32]);
    client
        .write(ctl_fid, 0, format!("register user=carl auth-id=desktop proto=ed25519 pubkey={pubkey_hex}").as_bytes())
        .await
        .unwrap();

    let (log_fid, _) = client.walk(root_fid, &["log".to_string()]).await.unwrap();
    client.open(log_fid, om::READ).await.unwrap();
    let data = client.read(log_fid, 0, 4096).await.unwrap();
    let text = String::from_utf8(data).unwrap();
    assert!(text.contains("register user=carl auth-id=desktop"));
}
