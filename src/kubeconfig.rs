//! Credential-bundle patching.
//!
//! The cluster installer writes its kubeconfig with a loopback server
//! address by convention. [`patch_kubeconfig`] rewrites the host component
//! of the single `server:` line to the resolved endpoint, preserving scheme
//! and port, and leaving every other byte untouched. The patch is
//! line-oriented (the bundle is never parsed as a structured
//! document) and idempotent: re-patching with the same endpoint reproduces the same
//! bytes. The source file is never mutated in place; callers write the
//! result to a new location.

use std::path::Path;

use tracing::debug;

use crate::cluster::Endpoint;
use crate::{Error, Result};

/// Rewrite the host of the single `server:` line to the resolved endpoint.
///
/// Scheme and port are preserved from the original URL; only the host
/// component changes. A bundle with zero or multiple `server:` lines is
/// malformed for this protocol.
pub fn patch_kubeconfig(raw: &str, endpoint: &Endpoint) -> Result<String> {
    let server_lines = raw
        .split_inclusive('\n')
        .filter(|line| is_server_line(line))
        .count();
    if server_lines != 1 {
        return Err(Error::serialization(format!(
            "credential bundle must declare exactly one server line, found {}",
            server_lines
        )));
    }

    let mut patched = String::with_capacity(raw.len());
    for line in raw.split_inclusive('\n') {
        if is_server_line(line) {
            patched.push_str(&rewrite_server_line(line, endpoint)?);
        } else {
            patched.push_str(line);
        }
    }

    debug!(host = %endpoint.host, "patched credential bundle server address");
    Ok(patched)
}

/// Write a bundle to a new location with owner-only permissions
pub async fn write_bundle(path: &Path, content: &str) -> Result<()> {
    tokio::fs::write(path, content).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

fn is_server_line(line: &str) -> bool {
    line.trim_start().starts_with("server:")
}

fn rewrite_server_line(line: &str, endpoint: &Endpoint) -> Result<String> {
    let newline = if line.ends_with('\n') { "\n" } else { "" };
    let body = line.trim_end_matches(['\n', '\r']);

    let indent_len = body.len() - body.trim_start().len();
    let indent = &body[..indent_len];

    let url = body
        .trim_start()
        .strip_prefix("server:")
        .expect("caller checked the prefix")
        .trim();

    let (scheme, rest) = url.split_once("://").ok_or_else(|| {
        Error::serialization(format!("server line has no scheme: '{}'", url))
    })?;
    if rest.is_empty() {
        return Err(Error::serialization("server line has an empty host".to_string()));
    }

    // Only the host component is rewritten; a declared port is preserved.
    let port_suffix = match rest.rsplit_once(':') {
        Some((_, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            format!(":{}", port)
        }
        _ => String::new(),
    };

    Ok(format!(
        "{}server: {}://{}{}{}",
        indent, scheme, endpoint.host, port_suffix, newline
    ))
}
