//! Self-signed key pair management for the loopback TLS listener.
//!
//! Two pieces of state: the key pair on disk (`server.crt` / `server.key`
//! under the keys path) and its trust registration in the OS certificate
//! store. Only startup and the `certificates` CLI subcommand touch these;
//! the serving hot path never does.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

/// Friendly name used when registering with the OS trust store.
#[cfg(all(unix, not(target_os = "macos")))]
const TRUST_NICKNAME: &str = "wsb-localhost-bridge";

pub fn cert_path(keys_path: &Path) -> PathBuf {
    keys_path.join("server.crt")
}

pub fn key_path(keys_path: &Path) -> PathBuf {
    keys_path.join("server.key")
}

pub fn exists(keys_path: &Path) -> bool {
    cert_path(keys_path).exists() && key_path(keys_path).exists()
}

/// Writes a fresh self-signed key pair for `localhost`, backing up any
/// existing pair first.
pub fn create(keys_path: &Path) -> Result<()> {
    std::fs::create_dir_all(keys_path)
        .with_context(|| format!("creating {}", keys_path.display()))?;
    if exists(keys_path) {
        backup_files(keys_path)?;
    }
    let certified = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .context("generating self-signed certificate")?;
    std::fs::write(cert_path(keys_path), certified.cert.pem())
        .with_context(|| format!("writing {}", cert_path(keys_path).display()))?;
    std::fs::write(key_path(keys_path), certified.key_pair.serialize_pem())
        .with_context(|| format!("writing {}", key_path(keys_path).display()))?;
    info!(keys_path = %keys_path.display(), "created self-signed key pair");
    Ok(())
}

/// Copies the current pair aside as `*.bak` and returns the backup paths.
pub fn backup_files(keys_path: &Path) -> Result<Vec<PathBuf>> {
    let mut backups = Vec::new();
    for original in [cert_path(keys_path), key_path(keys_path)] {
        if !original.exists() {
            continue;
        }
        let mut backup = original.clone();
        backup.set_extension(match original.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{ext}.bak"),
            None => "bak".to_string(),
        });
        std::fs::copy(&original, &backup)
            .with_context(|| format!("backing up {}", original.display()))?;
        backups.push(backup);
    }
    Ok(backups)
}

/// Registers the certificate with the user's trust store so the browser
/// accepts the loopback handshake.
pub fn register(keys_path: &Path) -> Result<bool> {
    let cert = cert_path(keys_path);
    if !cert.exists() {
        return Ok(false);
    }
    run_trust_tool(trust_register_command(&cert))
}

pub fn is_registered(_keys_path: &Path) -> Result<bool> {
    run_trust_tool(trust_query_command())
}

pub fn unregister(_keys_path: &Path) -> Result<bool> {
    run_trust_tool(trust_unregister_command())
}

fn run_trust_tool(mut command: Command) -> Result<bool> {
    match command.output() {
        Ok(output) => {
            if !output.status.success() {
                warn!(
                    status = ?output.status.code(),
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "trust store tool reported failure"
                );
            }
            Ok(output.status.success())
        }
        Err(err) => {
            warn!(%err, "trust store tool could not be launched");
            Ok(false)
        }
    }
}

#[cfg(target_os = "macos")]
fn trust_register_command(cert: &Path) -> Command {
    let mut cmd = Command::new("security");
    cmd.args(["add-trusted-cert", "-r", "trustRoot", "-k"])
        .arg(login_keychain())
        .arg(cert);
    cmd
}

#[cfg(target_os = "macos")]
fn trust_query_command() -> Command {
    let mut cmd = Command::new("security");
    cmd.args(["find-certificate", "-c", "localhost"])
        .arg(login_keychain());
    cmd
}

#[cfg(target_os = "macos")]
fn trust_unregister_command() -> Command {
    let mut cmd = Command::new("security");
    cmd.args(["delete-certificate", "-c", "localhost"])
        .arg(login_keychain());
    cmd
}

#[cfg(target_os = "macos")]
fn login_keychain() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Library/Keychains/login.keychain-db")
}

#[cfg(all(unix, not(target_os = "macos")))]
fn trust_register_command(cert: &Path) -> Command {
    let mut cmd = Command::new("certutil");
    cmd.args(["-A", "-t", "C,,", "-n", TRUST_NICKNAME, "-d"])
        .arg(nss_db())
        .arg("-i")
        .arg(cert);
    cmd
}

#[cfg(all(unix, not(target_os = "macos")))]
fn trust_query_command() -> Command {
    let mut cmd = Command::new("certutil");
    cmd.args(["-L", "-n", TRUST_NICKNAME, "-d"]).arg(nss_db());
    cmd
}

#[cfg(all(unix, not(target_os = "macos")))]
fn trust_unregister_command() -> Command {
    let mut cmd = Command::new("certutil");
    cmd.args(["-D", "-n", TRUST_NICKNAME, "-d"]).arg(nss_db());
    cmd
}

#[cfg(all(unix, not(target_os = "macos")))]
fn nss_db() -> String {
    let home = dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."));
    format!("sql:{}/.pki/nssdb", home.display())
}

#[cfg(windows)]
fn trust_register_command(cert: &Path) -> Command {
    let mut cmd = Command::new("certutil");
    cmd.args(["-user", "-addstore", "Root"]).arg(cert);
    cmd
}

#[cfg(windows)]
fn trust_query_command() -> Command {
    let mut cmd = Command::new("certutil");
    cmd.args(["-user", "-verifystore", "Root", "localhost"]);
    cmd
}

#[cfg(windows)]
fn trust_unregister_command() -> Command {
    let mut cmd = Command::new("certutil");
    cmd.args(["-user", "-delstore", "Root", "localhost"]);
    cmd
}
