use std::env;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};

use crate::api::NodeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// On-disk config already matches; nothing was written.
    Unchanged,
    /// A new config file was swapped in.
    Applied,
}

pub fn config_path(interface: &str) -> PathBuf {
    env::var("HUBNET_WG_CONF")
        .map(PathBuf::from)
        .unwrap_or_else(|_| Path::new("/etc/wireguard").join(format!("{}.conf", interface)))
}

/// Renders the tunnel document the external tunnel tool consumes. The
/// private key is substituted locally; it is never part of the fetched
/// configuration.
pub fn render(config: &NodeConfig, private_key: &str) -> String {
    let mut lines = vec!["[Interface]".to_string()];
    lines.push(format!("PrivateKey = {}", private_key));
    for addr in &config.interface.address {
        lines.push(format!("Address = {}", addr));
    }
    if let Some(port) = config.interface.listen_port {
        lines.push(format!("ListenPort = {}", port));
    }
    lines.push(format!("MTU = {}", config.interface.mtu));

    for peer in &config.peers {
        lines.push(String::new());
        lines.push("[Peer]".to_string());
        lines.push(format!("PublicKey = {}", peer.public_key));
        for allowed in &peer.allowed_ips {
            lines.push(format!("AllowedIPs = {}", allowed));
        }
        if let Some(endpoint) = &peer.endpoint {
            lines.push(format!("Endpoint = {}", endpoint));
        }
        if let Some(keepalive) = peer.keepalive {
            lines.push(format!("PersistentKeepalive = {}", keepalive));
        }
    }

    lines.join("\n") + "\n"
}

/// Swaps the canonical config file for new contents: write a temp file
/// in the same directory, let the tunnel tool's strip mode reject
/// malformed output, then rename over the original. Identical contents
/// short-circuit so an unchanged fetch never touches the interface.
pub fn apply(path: &Path, contents: &str) -> Result<ApplyOutcome> {
    if let Ok(existing) = fs::read_to_string(path) {
        if existing == contents {
            return Ok(ApplyOutcome::Unchanged);
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = tmp_path(path);
    write_private(&tmp, contents)?;

    if let Err(err) = strip_check(&tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("replacing config at {}", path.display()))?;

    Ok(ApplyOutcome::Applied)
}

// The temp name keeps a .conf suffix because wg-quick derives the
// interface name from the basename and refuses anything else.
fn tmp_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|n| n.to_str())
        .unwrap_or("tunnel");
    path.with_file_name(format!("{}.tmp.conf", stem))
}

fn write_private(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents)
        .with_context(|| format!("writing {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

/// `wg-quick strip` parses the file and fails on anything malformed
/// without touching interface state.
fn strip_check(path: &Path) -> Result<()> {
    let output = Command::new("wg-quick")
        .arg("strip")
        .arg(path)
        .output()
        .context("invoking wg-quick strip")?;

    if !output.status.success() {
        bail!(
            "wg-quick rejected the generated config: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(())
}

pub fn interface_up(interface: &str) -> bool {
    Command::new("wg")
        .arg("show")
        .arg(interface)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Tears the interface down (when up) and brings it up with the new
/// config file.
pub fn restart(interface: &str, path: &Path) -> Result<()> {
    if interface_up(interface) {
        // A failed teardown is not fatal; wg-quick up reports the real
        // problem if one exists.
        match Command::new("wg-quick").arg("down").arg(path).status() {
            Ok(status) if status.success() => {}
            Ok(status) => eprintln!("[agent] wg-quick down exited with {}", status),
            Err(err) => eprintln!("[agent] failed to invoke wg-quick down: {:?}", err),
        }
    }

    bring_up(interface, path)
}

/// Brings the interface up only if it is not already running.
pub fn ensure_up(interface: &str, path: &Path) -> Result<()> {
    if interface_up(interface) {
        return Ok(());
    }
    if !path.exists() {
        println!(
            "[agent] no tunnel config at {:?} yet; skipping bring-up",
            path
        );
        return Ok(());
    }
    bring_up(interface, path)
}

fn bring_up(interface: &str, path: &Path) -> Result<()> {
    let status = Command::new("wg-quick")
        .arg("up")
        .arg(path)
        .status()
        .context("invoking wg-quick up")?;

    if !status.success() {
        bail!("wg-quick up {:?} exited with {}", path, status);
    }

    println!("[agent] interface {} is up", interface);
    Ok(())
}
