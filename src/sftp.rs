use std::fmt;

use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

#[derive(Debug, Clone)]
pub enum SftpError {
    NotFound(String),
    PermissionDenied(String),
    Timeout,
    Protocol(String),
}

impl fmt::Display for SftpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(path) => write!(f, "path not found: {path}"),
            Self::PermissionDenied(path) => write!(f, "permission denied: {path}"),
            Self::Timeout => write!(f, "sftp operation timed out"),
            Self::Protocol(msg) => write!(f, "sftp protocol error: {msg}"),
        }
    }
}

impl std::error::Error for SftpError {}

impl From<russh_sftp::error::Error> for SftpError {
    fn from(value: russh_sftp::error::Error) -> Self {
        use russh_sftp::protocol::StatusCode;
        match value {
            russh_sftp::error::Error::Status(status) if status.status_code == StatusCode::NoSuchFile => {
                Self::NotFound(status.error_message)
            }
            russh_sftp::error::Error::Status(status) if status.status_code == StatusCode::PermissionDenied => {
                Self::PermissionDenied(status.error_message)
            }
            other => Self::Protocol(other.to_string()),
        }
    }
}

/// Metadata needed to record a `KeyLocation` without reading the file body.
#[derive(Debug, Clone)]
pub struct RemoteFileMeta {
    pub size: Option<i64>,
    pub mtime: Option<i64>,
    pub owner_uid: Option<String>,
    pub perms: Option<i32>,
}

impl From<FileAttributes> for RemoteFileMeta {
    fn from(attrs: FileAttributes) -> Self {
        Self {
            size: attrs.size.map(|s| s as i64),
            mtime: attrs.mtime.map(|t| t as i64),
            owner_uid: attrs.uid.map(|u| u.to_string()),
            perms: attrs.permissions.map(|p| p as i32),
        }
    }
}

/// Thin, bounded wrapper around one `russh_sftp` session. Every read caps
/// the number of bytes or lines pulled so a giant or adversarial log file
/// can't exhaust memory.
pub struct SftpReader<'a> {
    session: &'a SftpSession,
}

impl<'a> SftpReader<'a> {
    pub fn new(session: &'a SftpSession) -> Self {
        Self { session }
    }

    pub async fn exists(&self, path: &str) -> bool {
        self.session.metadata(path).await.is_ok()
    }

    pub async fn stat(&self, path: &str) -> Result<RemoteFileMeta, SftpError> {
        Ok(self.session.metadata(path).await?.into())
    }

    pub async fn list_dir(&self, path: &str) -> Result<Vec<String>, SftpError> {
        let dir = self.session.read_dir(path).await?;
        Ok(dir
            .into_iter()
            .map(|entry| entry.file_name())
            .filter(|name| name != "." && name != "..")
            .collect())
    }

    /// Reads at most `max_bytes` from the start of `path`.
    pub async fn read_file(&self, path: &str, max_bytes: usize) -> Result<Vec<u8>, SftpError> {
        let mut file = self.session.open(path).await?;
        let mut buf = vec![0u8; max_bytes];
        let mut total = 0;
        loop {
            let n = file.read(&mut buf[total..]).await.map_err(|e| SftpError::Protocol(e.to_string()))?;
            if n == 0 || total + n >= max_bytes {
                total += n;
                break;
            }
            total += n;
        }
        buf.truncate(total);
        Ok(buf)
    }

    /// Reads at most the last `max_lines` lines of `path`, seeking from the
    /// end in growing chunks rather than pulling the whole file.
    pub async fn read_file_tail(&self, path: &str, max_lines: usize) -> Result<Vec<String>, SftpError> {
        let mut file = self.session.open(path).await?;
        let size = file
            .metadata()
            .await
            .map_err(SftpError::from)?
            .size
            .unwrap_or(0);

        let mut window = 64 * 1024u64;
        loop {
            let start = size.saturating_sub(window);
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|e| SftpError::Protocol(e.to_string()))?;

            let mut buf = Vec::new();
            file.read_to_end(&mut buf)
                .await
                .map_err(|e| SftpError::Protocol(e.to_string()))?;

            let text = String::from_utf8_lossy(&buf);
            let lines: Vec<String> = text.lines().map(str::to_owned).collect();

            if lines.len() > max_lines || start == 0 {
                let tail = if lines.len() > max_lines {
                    lines[lines.len() - max_lines..].to_vec()
                } else {
                    lines
                };
                return Ok(tail);
            }
            window *= 4;
        }
    }
}
