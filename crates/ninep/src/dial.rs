//! Dial string parsing and connect/listen helpers.
//!
//! Grammar: `protocol ! host ! port` for `tcp`, `protocol ! path` for
//! `unix` (no port component). Service-name ports resolve to fixed
//! numeric ports; numeric ports are accepted verbatim.

use std::path::PathBuf;

use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::utils::Result;

/// v9fs / Plan 9 file service port.
pub const PORT_9FS: u16 = 564;
/// Alias for the same registered service.
pub const PORT_9PFS: u16 = 564;
/// Plan 9 connection server (`cs`) rendezvous port.
pub const PORT_RENDEZVOUS: u16 = 17019;

/// A parsed dial address, ready to connect or listen on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dial {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

fn resolve_port(s: &str) -> Result<u16> {
    match s {
        "9pfs" => Ok(PORT_9PFS),
        "9fs" => Ok(PORT_9FS),
        "rendezvous" => Ok(PORT_RENDEZVOUS),
        _ => s
            .parse::<u16>()
            .map_err(|_| proto_err!("invalid port {:?}", s)),
    }
}

impl Dial {
    /// Parse a dial string. `default_port`, if given, is used when the
    /// string supplies no port field for `tcp`.
    pub fn parse(addr: &str, default_port: Option<u16>) -> Result<Dial> {
        let mut parts = addr.split('!');
        let proto = parts
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("tcp");

        match proto {
            "unix" => {
                let path = parts
                    .next()
                    .ok_or_else(|| proto_err!("unix dial string missing path: {:?}", addr))?;
                Ok(Dial::Unix { path: PathBuf::from(path) })
            }
            "tcp" => {
                let host = parts
                    .next()
                    .ok_or_else(|| proto_err!("tcp dial string missing host: {:?}", addr))?;
                let port = match parts.next() {
                    Some(p) => resolve_port(p)?,
                    None => default_port
                        .ok_or_else(|| proto_err!("tcp dial string missing port: {:?}", addr))?,
                };
                Ok(Dial::Tcp { host: host.to_string(), port })
            }
            other => Err(proto_err!("unknown dial protocol: {:?}", other)),
        }
    }

    pub async fn connect(&self) -> Result<Conn> {
        match self {
            Dial::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                Ok(Conn::Tcp(stream))
            }
            Dial::Unix { path } => {
                let stream = UnixStream::connect(path).await?;
                Ok(Conn::Unix(stream))
            }
        }
    }

    pub async fn listen(&self) -> Result<Listener> {
        match self {
            Dial::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                Ok(Listener::Tcp(listener))
            }
            Dial::Unix { path } => {
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path)?;
                Ok(Listener::Unix(listener, path.clone()))
            }
        }
    }
}

/// An established connection, transport-erased for the server loop.
pub enum Conn {
    Tcp(TcpStream),
    Unix(UnixStream),
}

/// A bound listener, transport-erased for the accept loop.
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_with_port() {
        let d = Dial::parse("tcp!127.0.0.1!564", None).unwrap();
        assert_eq!(d, Dial::Tcp { host: "127.0.0.1".into(), port: 564 });
    }

    #[test]
    fn parses_tcp_with_service_name() {
        let d = Dial::parse("tcp!example.com!9pfs", None).unwrap();
        assert_eq!(d, Dial::Tcp { host: "example.com".into(), port: 564 });
    }

    #[test]
    fn parses_unix_without_port() {
        let d = Dial::parse("unix!/tmp/ninep.sock", None).unwrap();
        assert_eq!(d, Dial::Unix { path: "/tmp/ninep.sock".into() });
    }

    #[test]
    fn defaults_missing_port() {
        let d = Dial::parse("tcp!127.0.0.1", Some(564)).unwrap();
        assert_eq!(d, Dial::Tcp { host: "127.0.0.1".into(), port: 564 });
    }

    #[test]
    fn rejects_missing_port_without_default() {
        assert!(Dial::parse("tcp!127.0.0.1", None).is_err());
    }

    #[test]
    fn rejects_unknown_protocol() {
        assert!(Dial::parse("quic!127.0.0.1!1234", None).is_err());
    }
}
