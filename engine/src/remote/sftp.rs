//! SFTP transport over a single SSH session.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;

use ssh2::{Session, Sftp};
use tracing::{debug, warn};

use super::{RemoteChannel, RemoteStat, RemoteTransport};
use crate::error::{EngineError, Result};
use crate::model::{RemoteAuth, RemoteTarget};

/// One authenticated SSH session. Each worker gets its own SFTP channel.
///
/// The session is disconnected when the transport is dropped.
pub struct SftpTransport {
    session: Session,
    label: String,
}

impl SftpTransport {
    /// Connect and authenticate, bounded by the target's timeout.
    pub fn connect(target: &RemoteTarget) -> Result<Self> {
        let label = target.label();
        let connect_error = |source: io::Error| EngineError::RemoteConnect {
            target: label.clone(),
            source,
        };

        let addr = (target.host.as_str(), target.port)
            .to_socket_addrs()
            .map_err(connect_error)?
            .next()
            .ok_or_else(|| {
                connect_error(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("cannot resolve {}", target.host),
                ))
            })?;

        let tcp = TcpStream::connect_timeout(&addr, target.timeout()).map_err(connect_error)?;
        let mut session = Session::new().map_err(|e| connect_error(e.into()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(target.timeout().as_millis().min(u32::MAX as u128) as u32);
        session.handshake().map_err(|e| connect_error(e.into()))?;

        match &target.auth {
            RemoteAuth::Password { password } => session
                .userauth_password(&target.username, password.expose())
                .map_err(|e| connect_error(e.into()))?,
            RemoteAuth::KeyFile { path, passphrase } => session
                .userauth_pubkey_file(
                    &target.username,
                    None,
                    path,
                    passphrase.as_ref().map(|p| p.expose()),
                )
                .map_err(|e| connect_error(e.into()))?,
        }

        if !session.authenticated() {
            return Err(connect_error(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "authentication rejected",
            )));
        }

        debug!(target = %label, "ssh session established");
        Ok(SftpTransport { session, label })
    }
}

impl RemoteTransport for SftpTransport {
    fn open_channel(&self) -> io::Result<Box<dyn RemoteChannel>> {
        let sftp = self.session.sftp()?;
        Ok(Box::new(SftpChannel { sftp }))
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

impl Drop for SftpTransport {
    fn drop(&mut self) {
        if let Err(e) = self.session.disconnect(None, "backup finished", None) {
            warn!(target = %self.label, error = %e, "ssh disconnect failed");
        }
    }
}

struct SftpChannel {
    sftp: Sftp,
}

impl RemoteChannel for SftpChannel {
    fn stat(&self, path: &str) -> io::Result<RemoteStat> {
        let stat = self.sftp.stat(Path::new(path))?;
        Ok(RemoteStat {
            size: stat.size,
            mtime: stat.mtime,
        })
    }

    fn mkdir(&self, path: &str) -> io::Result<()> {
        self.sftp.mkdir(Path::new(path), 0o755)?;
        Ok(())
    }

    fn upload(&self, local: &Path, remote: &str) -> io::Result<u64> {
        let mut source = File::open(local)?;
        let mut target = self.sftp.create(Path::new(remote))?;
        let bytes = io::copy(&mut source, &mut target)?;
        target.flush()?;
        Ok(bytes)
    }

    fn read_to_string(&self, path: &str) -> io::Result<String> {
        let mut file = self.sftp.open(Path::new(path))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(contents)
    }

    fn write(&self, path: &str, contents: &[u8]) -> io::Result<()> {
        let mut file = self.sftp.create(Path::new(path))?;
        file.write_all(contents)?;
        file.flush()
    }
}
