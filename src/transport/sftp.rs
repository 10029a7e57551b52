use async_trait::async_trait;
use ssh2::{HashType, Session, Sftp};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::{RemoteDir, Transport, TransportError};
use crate::config::SftpSettings;

struct Connection {
    // Keeps the SSH channel alive for as long as the SFTP subsystem is used.
    _session: Session,
    sftp: Sftp,
}

/// ASP's SFTP endpoint. All calls are blocking and run on tokio's blocking pool,
/// one at a time.
#[derive(Clone)]
pub struct SftpTransport {
    conn: Arc<Mutex<Connection>>,
    upload_dir: PathBuf,
    download_dir: PathBuf,
}

impl std::fmt::Debug for SftpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpTransport")
            .field("upload_dir", &self.upload_dir)
            .field("download_dir", &self.download_dir)
            .finish_non_exhaustive()
    }
}

fn ssh_err(err: ssh2::Error) -> TransportError {
    TransportError::Connect(err.to_string())
}

fn remote_err(op: &'static str, path: &Path, err: impl std::fmt::Display) -> TransportError {
    TransportError::Remote {
        op,
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl SftpTransport {
    #[instrument(skip_all, fields(host = %settings.host, port = settings.port))]
    pub async fn connect(settings: &SftpSettings) -> Result<Self, TransportError> {
        let settings = settings.clone();
        tokio::task::spawn_blocking(move || Self::connect_blocking(&settings))
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?
    }

    fn connect_blocking(settings: &SftpSettings) -> Result<Self, TransportError> {
        let timeout = Duration::from_millis(settings.connect_timeout_ms);
        let addr = (settings.host.as_str(), settings.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TransportError::Connect(format!("cannot resolve {}", settings.host)))?;
        let tcp = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|err| TransportError::Connect(format!("{addr}: {err}")))?;

        let mut session = Session::new().map_err(ssh_err)?;
        session.set_timeout(settings.connect_timeout_ms.min(u32::MAX as u64) as u32);
        session.set_tcp_stream(tcp);
        session.handshake().map_err(ssh_err)?;

        if let Some(expected) = &settings.host_fingerprint {
            let actual = session
                .host_key_hash(HashType::Sha256)
                .map(hex)
                .unwrap_or_default();
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(TransportError::Connect(format!(
                    "host key fingerprint mismatch: got {actual}"
                )));
            }
        }

        session
            .userauth_pubkey_file(
                &settings.user,
                None,
                Path::new(&settings.private_key_path),
                settings.private_key_passphrase.as_deref(),
            )
            .map_err(ssh_err)?;
        if !session.authenticated() {
            return Err(TransportError::Connect("authentication rejected".into()));
        }

        let sftp = session.sftp().map_err(ssh_err)?;
        info!(host = %settings.host, "connected to ASP SFTP");
        Ok(Self {
            conn: Arc::new(Mutex::new(Connection {
                _session: session,
                sftp,
            })),
            upload_dir: PathBuf::from(&settings.upload_dir),
            download_dir: PathBuf::from(&settings.download_dir),
        })
    }

    fn dir(&self, dir: RemoteDir) -> &Path {
        match dir {
            RemoteDir::Deposit => &self.upload_dir,
            RemoteDir::Withdrawal => &self.download_dir,
        }
    }

    async fn with_sftp<T, F>(&self, f: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp) -> Result<T, TransportError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| TransportError::Connect("SFTP connection poisoned".into()))?;
            f(&guard.sftp)
        })
        .await
        .map_err(|err| TransportError::Connect(err.to_string()))?
    }
}

#[async_trait]
impl Transport for SftpTransport {
    async fn upload(&self, name: &str, bytes: &[u8]) -> Result<(), TransportError> {
        let path = self.upload_dir.join(name);
        let bytes = bytes.to_vec();
        debug!(path = %path.display(), size = bytes.len(), "sftp put");
        self.with_sftp(move |sftp| {
            let mut file = sftp.create(&path).map_err(|e| remote_err("put", &path, e))?;
            file.write_all(&bytes)
                .map_err(|e| remote_err("put", &path, e))?;
            Ok(())
        })
        .await
    }

    async fn list(&self, dir: RemoteDir) -> Result<Vec<String>, TransportError> {
        let path = self.dir(dir).to_path_buf();
        self.with_sftp(move |sftp| {
            let entries = sftp.readdir(&path).map_err(|e| remote_err("list", &path, e))?;
            let mut names: Vec<String> = entries
                .into_iter()
                .filter(|(_, stat)| stat.is_file())
                .filter_map(|(p, _)| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .collect();
            names.sort();
            Ok(names)
        })
        .await
    }

    async fn download(&self, dir: RemoteDir, name: &str) -> Result<Vec<u8>, TransportError> {
        let path = self.dir(dir).join(name);
        debug!(path = %path.display(), "sftp get");
        self.with_sftp(move |sftp| {
            let mut file = sftp.open(&path).map_err(|e| remote_err("get", &path, e))?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)
                .map_err(|e| remote_err("get", &path, e))?;
            Ok(buf)
        })
        .await
    }

    async fn delete(&self, dir: RemoteDir, name: &str) -> Result<(), TransportError> {
        let path = self.dir(dir).join(name);
        debug!(path = %path.display(), "sftp delete");
        self.with_sftp(move |sftp| sftp.unlink(&path).map_err(|e| remote_err("delete", &path, e)))
            .await
    }
}
