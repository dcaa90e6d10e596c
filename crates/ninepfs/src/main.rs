use clap::Parser;
use tokio::fs;

use ninep::dial::Dial;
use ninep::srv::srv_async;

use ninepfs::NinepFs;

#[derive(Debug, clap::Parser)]
#[command(about = "9P2000 file-server: serves a host directory, with tmp/ backed by memory")]
struct Cli {
    /// Dial address: "tcp!host!port" or "unix!path"
    address: String,

    /// Directory to export
    exportdir: std::path::PathBuf,

    /// Reject all mutating operations (create, write, wstat, remove)
    #[arg(long)]
    readonly: bool,
}

async fn ninepfs_main(Cli { address, exportdir, readonly }: Cli) -> ninep::Result<i32> {
    if !fs::try_exists(&exportdir).await? {
        fs::create_dir_all(&exportdir).await?;
    }
    if !fs::metadata(&exportdir).await?.is_dir() {
        return Err(ninep::Error::protocol("mount point must be a directory"));
    }

    let uid = nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| "none".to_owned());
    let gid = nix::unistd::Group::from_gid(nix::unistd::getgid())
        .ok()
        .flatten()
        .map(|g| g.name)
        .unwrap_or_else(|| "none".to_owned());

    let dial = Dial::parse(&address, None)?;
    log::info!("exporting {:?} ({}read-only) on {}", exportdir, if readonly { "" } else { "not " }, address);

    srv_async(NinepFs::new(exportdir, readonly, &uid, &gid), &dial).await.and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = ninepfs_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}
