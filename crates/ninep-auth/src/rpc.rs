//! Auth RPC state machine: `start`/`read`/`write`, per spec.md §4.6 and
//! grounded in full on `original_source/auth/rpc.c`.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::core::{now_unix, AuthError, AuthProto, Conv, Key, KeyRing, Role};
use crate::crypto::{ed25519, fido2::Fido2Authenticator};

/// A parsed `/rpc` command. `read`/`write` carry no parameters in
/// parsed form (spec.md §4.6) — `write`'s payload is the raw bytes of
/// the command itself when they don't parse as a `start` line.
#[derive(Clone, Debug)]
pub enum Command {
    Start(StartParams),
    Read,
    Write(Vec<u8>),
}

#[derive(Clone, Debug, Default)]
pub struct StartParams {
    pub user: String,
    pub auth_id: String,
    pub proto: Option<String>,
    pub role: String,
}

/// Parses a `/rpc` write. `"start k=v ..."` and `"read"` (case
/// insensitive, matching a plain textual command channel) are control
/// verbs; anything else is treated as the write-phase wire payload,
/// mirroring `auth_rpc_parse`'s "anything else is Write" fallback.
pub fn parse(raw: &[u8]) -> Command {
    if let Ok(text) = std::str::from_utf8(raw) {
        let trimmed = text.trim();
        if trimmed.eq_ignore_ascii_case("read") {
            return Command::Read;
        }
        if trimmed.len() >= 5 && trimmed[..5].eq_ignore_ascii_case("start") {
            return Command::Start(parse_start(trimmed));
        }
    }
    Command::Write(raw.to_vec())
}

fn parse_start(line: &str) -> StartParams {
    let mut params = StartParams::default();
    for token in line.split_whitespace().skip(1) {
        let Some((key, value)) = token.split_once('=') else { continue };
        match key {
            "user" => params.user = value.to_owned(),
            "auth-id" => params.auth_id = value.to_owned(),
            "proto" => params.proto = Some(value.to_owned()),
            "role" => params.role = value.to_owned(),
            _ => {}
        }
    }
    params
}

#[derive(Clone, Debug, Default)]
pub struct Response {
    pub success: bool,
    pub error: Option<String>,
    pub data: Vec<u8>,
}

impl Response {
    fn ok(data: Vec<u8>) -> Response {
        Response { success: true, error: None, data }
    }

    fn err(msg: impl Into<String>) -> Response {
        Response { success: false, error: Some(msg.into()), data: Vec::new() }
    }
}

/// Process-wide auth state: the key-ring, its backing file, and the
/// append-only log exposed at `/log`. One [`Engine`] is shared by every
/// connection; conversations themselves live in the owning 9P fid (see
/// `fs::AuthFId`), not here — see `Conv`'s doc comment for why.
pub struct Engine {
    keyring: Mutex<KeyRing>,
    keys_path: Option<PathBuf>,
    log: Mutex<Vec<String>>,
    fido2: Arc<dyn Fido2Authenticator>,
}

impl Engine {
    pub fn new(keyring: KeyRing, keys_path: Option<PathBuf>, fido2: Arc<dyn Fido2Authenticator>) -> Engine {
        Engine { keyring: Mutex::new(keyring), keys_path, log: Mutex::new(Vec::new()), fido2 }
    }

    pub async fn keyring(&self) -> tokio::sync::MutexGuard<'_, KeyRing> {
        self.keyring.lock().await
    }

    pub async fn log(&self, entry: impl Into<String>) {
        self.log.lock().await.push(entry.into());
    }

    pub async fn log_snapshot(&self) -> Vec<u8> {
        let entries = self.log.lock().await;
        let mut out = String::new();
        for entry in entries.iter() {
            out.push_str(entry);
            out.push('\n');
        }
        out.into_bytes()
    }

    pub async fn key_snapshot(&self) -> Vec<u8> {
        self.keyring.lock().await.save().into_bytes()
    }

    /// Reloads the ring from `keys_path`, matching `auth_rpc_handle_start`'s
    /// reload-on-every-start behavior. A missing or empty file is not an
    /// error (an auth daemon's first run has no ring yet).
    async fn reload_keyring(&self) -> Result<(), AuthError> {
        let Some(path) = &self.keys_path else { return Ok(()) };
        let data = match tokio::fs::read_to_string(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(AuthError::rejected(format!("failed to read key ring: {e}"))),
        };
        if data.is_empty() {
            return Ok(());
        }
        let ring = KeyRing::load(&data)?;
        *self.keyring.lock().await = ring;
        Ok(())
    }

    /// Persists the ring to `keys_path`, called by `/ctl` after a
    /// successful add-key/remove-key.
    pub async fn persist_keyring(&self) -> std::io::Result<()> {
        let Some(path) = &self.keys_path else { return Ok(()) };
        let data = self.keyring.lock().await.save();
        tokio::fs::write(path, data).await
    }

    /// Runs a parsed command against an existing (or absent)
    /// conversation, mirroring `auth_rpc_execute`'s dispatch. On success
    /// a new or updated `Conv` is written back through `conv`.
    pub async fn execute(&self, conv: &mut Option<Conv>, command: Command) -> Response {
        match command {
            Command::Start(params) => {
                let (new_conv, response) = self.handle_start(params).await;
                if response.success {
                    *conv = new_conv;
                }
                response
            }
            Command::Read => match conv {
                Some(c) => self.handle_read(c).await,
                None => Response::err("auth: no active conversation"),
            },
            Command::Write(data) => match conv {
                Some(c) => self.handle_write(c, &data).await,
                None => Response::err("auth: no active conversation"),
            },
        }
    }

    async fn handle_start(&self, params: StartParams) -> (Option<Conv>, Response) {
        if params.user.is_empty() {
            return (None, Response::err("auth: user required"));
        }

        let proto = match params.proto.as_deref() {
            None => None,
            Some(s) => match AuthProto::from_name(s) {
                Some(p) => Some(p),
                None => return (None, Response::err("auth: unsupported protocol")),
            },
        };

        let role = match params.role.as_str() {
            "client" => Role::Client,
            "server" => Role::Server,
            _ => return (None, Response::err("auth: invalid role")),
        };

        if let Err(e) = self.reload_keyring().await {
            return (None, Response::err(e.to_string()));
        }

        let mut key: Option<Key> = None;
        if proto.is_some() || role == Role::Client {
            let ring = self.keyring.lock().await;
            match ring.lookup(&params.user, &params.auth_id, proto) {
                Some(k) => key = Some(k.clone()),
                None => return (None, Response::err("auth: no credential found")),
            }
        }

        let mut conv = Conv::new(params.user, params.auth_id, role);
        conv.proto = proto.or_else(|| key.as_ref().map(|k| k.proto));
        conv.key = key;

        match role {
            Role::Server => {
                let challenge = match conv.key.as_ref().map(|k| k.proto) {
                    Some(AuthProto::Fido2) => self.fido2.generate_challenge(),
                    _ => ed25519::generate_challenge(),
                };
                conv.challenge = challenge;
                conv.state = crate::core::AuthState::ChallengeReady;
            }
            Role::Client => {
                conv.state = crate::core::AuthState::Started;
            }
        }

        (Some(conv), Response::ok(Vec::new()))
    }

    async fn handle_read(&self, conv: &mut Conv) -> Response {
        use crate::core::AuthState::*;

        if conv.is_expired(now_unix()) {
            conv.fail("auth: conversation expired");
            return Response::err("auth: conversation expired");
        }

        match conv.state {
            ChallengeReady => {
                let mut data = Vec::with_capacity(36);
                data.extend_from_slice(&(conv.start_time as u32).to_le_bytes());
                data.extend_from_slice(&conv.challenge);
                conv.state = ChallengeSent;
                Response::ok(data)
            }
            Done if conv.role == Role::Client && !conv.signature.is_empty() => {
                Response::ok(self.encode_client_blob(conv))
            }
            Done => Response::ok(b"done".to_vec()),
            Error => Response::err(conv.error.clone().unwrap_or_else(|| "auth: error".to_owned())),
            _ => Response::err("auth: invalid state for read"),
        }
    }

    fn encode_client_blob(&self, conv: &Conv) -> Vec<u8> {
        let proto = conv.proto.unwrap_or(AuthProto::Ed25519);
        let mut data = Vec::new();
        data.extend_from_slice(&(proto as u64).to_le_bytes());
        if proto == AuthProto::Ed25519 {
            if let Some(key) = &conv.key {
                data.extend_from_slice(&key.public_key);
            }
        }
        if !conv.auth_data.is_empty() {
            data.extend_from_slice(&(conv.auth_data.len() as u64).to_le_bytes());
            data.extend_from_slice(&conv.auth_data);
        }
        data.extend_from_slice(&conv.signature);
        data
    }

    async fn handle_write(&self, conv: &mut Conv, data: &[u8]) -> Response {
        use crate::core::AuthState::*;

        if conv.is_expired(now_unix()) {
            conv.fail("auth: conversation expired");
            return Response::err("auth: conversation expired");
        }

        match conv.state {
            Started => self.handle_write_started(conv, data),
            ChallengeSent => self.handle_write_challenge_sent(conv, data).await,
            _ => Response::err("auth: invalid state for write"),
        }
    }

    fn handle_write_started(&self, conv: &mut Conv, data: &[u8]) -> Response {
        if data.len() != 36 {
            return Response::err("auth: invalid challenge format");
        }

        let timestamp = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if now_unix().saturating_sub(timestamp as u64) > crate::core::CONV_TIMEOUT_SECS {
            return Response::err("auth: challenge expired");
        }
        conv.challenge.copy_from_slice(&data[4..36]);

        let Some(key) = conv.key.clone() else {
            conv.fail("auth: no credential found");
            return Response::err("auth: no credential found");
        };

        match conv.proto {
            Some(AuthProto::Ed25519) => {
                let Some(private_key) = key.private_key else {
                    conv.fail("auth: no credential found");
                    return Response::err("auth: no credential found");
                };
                conv.signature = ed25519::sign(&private_key, &conv.challenge).to_vec();
                conv.auth_data.clear();
            }
            Some(AuthProto::Fido2) => match self.fido2.get_assertion(&key.credential_id, &conv.challenge) {
                Ok(assertion) => {
                    conv.signature = assertion.signature;
                    conv.auth_data = assertion.auth_data;
                }
                Err(e) => {
                    conv.fail(e.clone());
                    return Response::err(e);
                }
            },
            None => {
                conv.fail("auth: unsupported protocol");
                return Response::err("auth: unsupported protocol");
            }
        }

        conv.state = Done;
        conv.verified = true;
        Response::ok(Vec::new())
    }

    async fn handle_write_challenge_sent(&self, conv: &mut Conv, data: &[u8]) -> Response {
        if data.len() < 8 {
            return Response::err("auth: invalid data format: too small");
        }
        let wire_proto = u64::from_le_bytes(data[0..8].try_into().unwrap());
        let Some(proto) = AuthProto::from_u64(wire_proto) else {
            return Response::err("auth: invalid protocol in wire format");
        };
        let payload = &data[8..];

        if conv.key.is_none() {
            let ring = self.keyring.lock().await;
            let candidate = ring.lookup(&conv.user, &conv.auth_id, Some(proto)).and_then(|k| {
                if proto == AuthProto::Ed25519 {
                    if payload.len() >= 32 && payload[..32] == k.public_key[..] {
                        Some(k.clone())
                    } else {
                        None
                    }
                } else {
                    Some(k.clone())
                }
            });
            match candidate {
                Some(k) => conv.key = Some(k),
                None => {
                    conv.fail("auth: no credential found for protocol");
                    return Response::err("auth: no credential found for protocol");
                }
            }
        } else if conv.key.as_ref().unwrap().proto != proto {
            conv.fail("auth: signature protocol does not match credential");
            return Response::err("auth: signature protocol does not match credential");
        }
        if conv.proto.is_none() {
            conv.proto = Some(proto);
        }

        let key = conv.key.clone().unwrap();
        match proto {
            AuthProto::Ed25519 => {
                if payload.len() != 96 {
                    conv.fail("auth: invalid Ed25519 signature");
                    return Response::err("auth: invalid Ed25519 signature");
                }
                let signature: [u8; 64] = payload[32..96].try_into().unwrap();
                let public_key: [u8; 32] = key.public_key[..32].try_into().unwrap();
                conv.signature = signature.to_vec();
                conv.auth_data.clear();
                if !ed25519::verify(&public_key, &conv.challenge, &signature) {
                    conv.fail("auth: invalid Ed25519 signature");
                    return Response::err("auth: invalid Ed25519 signature");
                }
            }
            AuthProto::Fido2 => {
                if payload.len() < 8 {
                    conv.fail("auth: invalid FIDO2 format");
                    return Response::err("auth: invalid FIDO2 format");
                }
                let auth_data_len = u64::from_le_bytes(payload[0..8].try_into().unwrap()) as usize;
                if auth_data_len > 256 || 8 + auth_data_len > payload.len() {
                    conv.fail("auth: invalid auth_data length");
                    return Response::err("auth: invalid auth_data length");
                }
                let signature_len = payload.len() - 8 - auth_data_len;
                if signature_len > 256 {
                    conv.fail("auth: signature too large");
                    return Response::err("auth: signature too large");
                }
                let auth_data = payload[8..8 + auth_data_len].to_vec();
                let signature = payload[8 + auth_data_len..].to_vec();
                if let Err(e) =
                    self.fido2.verify_signature(&conv.challenge, &auth_data, &signature, &key.public_key)
                {
                    conv.fail(e.clone());
                    conv.auth_data = auth_data;
                    conv.signature = signature;
                    return Response::err(e);
                }
                conv.auth_data = auth_data;
                conv.signature = signature;
            }
        }

        conv.state = Done;
        conv.verified = true;
        Response::ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::fido2::MockFido2;

    fn engine() -> Engine {
        Engine::new(KeyRing::new(), None, Arc::new(MockFido2))
    }

    #[test]
    fn parse_recognizes_start_and_read() {
        match parse(b"start user=alice auth-id=laptop proto=ed25519 role=server") {
            Command::Start(p) => {
                assert_eq!(p.user, "alice");
                assert_eq!(p.auth_id, "laptop");
                assert_eq!(p.proto.as_deref(), Some("ed25519"));
                assert_eq!(p.role, "server");
            }
            _ => panic!("expected Start"),
        }
        assert!(matches!(parse(b"read"), Command::Read));
        assert!(matches!(parse(&[0, 1, 2, 3]), Command::Write(_)));
    }

    #[tokio::test]
    async fn start_without_user_is_rejected() {
        let engine = engine();
        let mut conv = None;
        let response = engine
            .execute(&mut conv, Command::Start(StartParams { role: "server".into(), ..Default::default() }))
            .await;
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("auth: user required"));
    }

    #[tokio::test]
    async fn server_role_with_no_credential_still_generates_challenge() {
        let engine = engine();
        let mut conv = None;
        let response = engine
            .execute(
                &mut conv,
                Command::Start(StartParams {
                    user: "alice".into(),
                    auth_id: "laptop".into(),
                    proto: None,
                    role: "server".into(),
                }),
            )
            .await;
        assert!(response.success);
        assert_eq!(conv.unwrap().state, crate::core::AuthState::ChallengeReady);
    }

    #[tokio::test]
    async fn client_role_without_matching_key_is_rejected() {
        let engine = engine();
        let mut conv = None;
        let response = engine
            .execute(
                &mut conv,
                Command::Start(StartParams {
                    user: "alice".into(),
                    auth_id: "laptop".into(),
                    proto: None,
                    role: "client".into(),
                }),
            )
            .await;
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("auth: no credential found"));
    }

    #[tokio::test]
    async fn full_ed25519_server_client_round_trip() {
        let (public_key, private_key) = ed25519::generate_keypair();
        let mut ring = KeyRing::new();
        ring.add(Key {
            proto: AuthProto::Ed25519,
            user: "alice".into(),
            auth_id: "laptop".into(),
            credential_id: Vec::new(),
            public_key: public_key.to_vec(),
            private_key: Some(private_key),
        })
        .unwrap();
        let engine = Engine::new(ring, None, Arc::new(MockFido2));

        let mut server_conv = None;
        engine
            .execute(
                &mut server_conv,
                Command::Start(StartParams {
                    user: "alice".into(),
                    auth_id: "laptop".into(),
                    proto: Some("ed25519".into()),
                    role: "server".into(),
                }),
            )
            .await;
        let challenge_read = engine.execute(&mut server_conv, Command::Read).await;
        assert!(challenge_read.success);
        assert_eq!(challenge_read.data.len(), 36);

        let mut client_conv = None;
        engine
            .execute(
                &mut client_conv,
                Command::Start(StartParams {
                    user: "alice".into(),
                    auth_id: "laptop".into(),
                    proto: Some("ed25519".into()),
                    role: "client".into(),
                }),
            )
            .await;
        let sign_response = engine.execute(&mut client_conv, Command::Write(challenge_read.data)).await;
        assert!(sign_response.success);
        let client_blob = engine.execute(&mut client_conv, Command::Read).await;
        assert!(client_blob.success);

        let verify_response = engine.execute(&mut server_conv, Command::Write(client_blob.data)).await;
        assert!(verify_response.success);
        assert_eq!(server_conv.unwrap().state, crate::core::AuthState::Done);
    }
}
