use log::{debug, warn};

use crate::fingerprint::{self, MalformedKey};
use crate::models::FileType;
use crate::sftp::{SftpError, SftpReader};

const IDENTITY_FILES: &[&str] = &[
    "id_rsa.pub",
    "id_ed25519.pub",
    "id_ecdsa.pub",
    "id_dsa.pub",
];

const AUTHORIZED_KEYS_FILES: &[&str] = &["authorized_keys", "authorized_keys2"];

/// One key found on a server, ready to become a `KeyLocation` once its
/// `SSHKey` row id is resolved (batched by the caller).
#[derive(Debug, Clone)]
pub struct FoundKey {
    pub file_path: String,
    pub file_type: FileType,
    pub unix_owner: Option<String>,
    pub unix_perms: Option<i32>,
    pub file_mtime: Option<i64>,
    pub file_size: Option<i64>,
    pub parsed: fingerprint::ParsedKey,
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub keys: Vec<FoundKey>,
    pub malformed_keys: usize,
}

struct PasswdEntry {
    username: String,
    home_dir: String,
}

fn parse_passwd(text: &str) -> Vec<PasswdEntry> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.splitn(7, ':');
            let username = fields.next()?.to_owned();
            let _password = fields.next()?;
            let _uid = fields.next()?;
            let _gid = fields.next()?;
            let _gecos = fields.next()?;
            let home_dir = fields.next()?.to_owned();
            let shell = fields.next().unwrap_or("");
            if shell.ends_with("nologin") || shell.ends_with("/false") || shell.is_empty() {
                return None;
            }
            Some(PasswdEntry { username, home_dir })
        })
        .collect()
}

/// Runs the full key-inventory procedure against one server over SFTP:
/// passwd enumeration, authorized_keys files, identity files, host keys.
pub async fn scan_server(sftp: &SftpReader<'_>) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();

    outcome.merge(scan_host_keys(sftp).await);

    let passwd = match sftp.read_file("/etc/passwd", 4 * 1024 * 1024).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!("couldn't read /etc/passwd: {e}");
            return outcome;
        }
    };

    for entry in parse_passwd(&passwd) {
        outcome.merge(scan_authorized_keys(sftp, &entry).await);
        outcome.merge(scan_identity_files(sftp, &entry).await);
    }

    outcome
}

async fn scan_authorized_keys(sftp: &SftpReader<'_>, entry: &PasswdEntry) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();

    for filename in AUTHORIZED_KEYS_FILES {
        let path = format!("{}/.ssh/{}", entry.home_dir, filename);
        if !sftp.exists(&path).await {
            continue;
        }

        let meta = sftp.stat(&path).await.ok();
        let contents = match sftp.read_file(&path, 1024 * 1024).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                debug!("couldn't read {path}: {e}");
                continue;
            }
        };

        for line in contents.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match fingerprint::parse_authorized_keys_line(trimmed) {
                Ok(parsed) => outcome.keys.push(FoundKey {
                    file_path: path.clone(),
                    file_type: FileType::AuthorizedKeys,
                    unix_owner: Some(entry.username.clone()),
                    unix_perms: meta.as_ref().and_then(|m| m.perms),
                    file_mtime: meta.as_ref().and_then(|m| m.mtime),
                    file_size: meta.as_ref().and_then(|m| m.size),
                    parsed,
                }),
                Err(MalformedKey::UnparsableLine(_) | MalformedKey::UnknownAlgorithm(_)) => {
                    outcome.malformed_keys += 1;
                }
            }
        }
    }

    outcome
}

async fn scan_identity_files(sftp: &SftpReader<'_>, entry: &PasswdEntry) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();

    for filename in IDENTITY_FILES {
        let path = format!("{}/.ssh/{}", entry.home_dir, filename);
        if !sftp.exists(&path).await {
            continue;
        }
        record_single_key(sftp, &path, FileType::Identity, Some(entry.username.clone()), &mut outcome)
            .await;
    }

    outcome
}

async fn scan_host_keys(sftp: &SftpReader<'_>) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();

    let entries = match sftp.list_dir("/etc/ssh").await {
        Ok(entries) => entries,
        Err(SftpError::NotFound(_)) => return outcome,
        Err(e) => {
            debug!("couldn't list /etc/ssh: {e}");
            return outcome;
        }
    };

    for name in entries {
        if name.starts_with("ssh_host_") && name.ends_with("_key.pub") {
            let path = format!("/etc/ssh/{name}");
            record_single_key(sftp, &path, FileType::HostKey, None, &mut outcome).await;
        }
    }

    outcome
}

async fn record_single_key(
    sftp: &SftpReader<'_>,
    path: &str,
    file_type: FileType,
    owner: Option<String>,
    outcome: &mut ScanOutcome,
) {
    let meta = sftp.stat(path).await.ok();
    let contents = match sftp.read_file(path, 16 * 1024).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            debug!("couldn't read {path}: {e}");
            return;
        }
    };

    match fingerprint::parse_public_key_file(&contents) {
        Ok(parsed) => outcome.keys.push(FoundKey {
            file_path: path.to_owned(),
            file_type,
            unix_owner: owner,
            unix_perms: meta.as_ref().and_then(|m| m.perms),
            file_mtime: meta.as_ref().and_then(|m| m.mtime),
            file_size: meta.as_ref().and_then(|m| m.size),
            parsed,
        }),
        Err(_) => outcome.malformed_keys += 1,
    }
}

impl ScanOutcome {
    fn merge(&mut self, other: ScanOutcome) {
        self.keys.extend(other.keys);
        self.malformed_keys += other.malformed_keys;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passwd_skips_system_accounts_without_shell() {
        let text = "root:x:0:0:root:/root:/bin/bash\n\
                     daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin\n\
                     alice:x:1000:1000:Alice:/home/alice:/bin/zsh\n";
        let entries = parse_passwd(text);
        let names: Vec<_> = entries.iter().map(|e| e.username.as_str()).collect();
        assert_eq!(names, vec!["root", "alice"]);
    }
}
