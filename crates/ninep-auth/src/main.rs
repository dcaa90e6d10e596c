use std::sync::Arc;

use clap::Parser;

use ninep::dial::Dial;
use ninep::srv::srv_async;

use ninep_auth::core::KeyRing;
use ninep_auth::crypto::fido2::MockFido2;
use ninep_auth::{AuthFs, Engine};

#[derive(Debug, clap::Parser)]
#[command(about = "Ed25519/FIDO2 auth coprocessor, served as a 9P2000 file tree")]
struct Cli {
    /// Dial address: "tcp!host!port" or "unix!path"
    address: String,

    /// Flat key-ring file (user auth_id credential_id_hex public_key_hex
    /// per line); loaded at startup and rewritten by `/ctl`'s `register`,
    /// `remove`, and `save` commands.
    #[arg(long)]
    keys: Option<std::path::PathBuf>,
}

async fn ninep_auth_main(Cli { address, keys }: Cli) -> ninep::Result<i32> {
    let ring = match &keys {
        Some(path) => match tokio::fs::read_to_string(path).await {
            Ok(data) if !data.is_empty() => KeyRing::load(&data)
                .map_err(|e| ninep::Error::protocol(format!("malformed key ring: {e}")))?,
            Ok(_) => KeyRing::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => KeyRing::new(),
            Err(e) => return Err(e.into()),
        },
        None => KeyRing::new(),
    };

    let engine = Arc::new(Engine::new(ring, keys.clone(), Arc::new(MockFido2)));
    let uid = nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| "auth".to_owned());
    let gid = nix::unistd::Group::from_gid(nix::unistd::getgid())
        .ok()
        .flatten()
        .map(|g| g.name)
        .unwrap_or_else(|| "auth".to_owned());

    let dial = Dial::parse(&address, None)?;
    log::info!("serving auth coprocessor on {address}");

    srv_async(AuthFs::new(engine, &uid, &gid), &dial).await.and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = ninep_auth_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}
