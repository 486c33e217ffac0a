//! Persistent static identity: a hex X25519 private key on disk.

use std::path::Path;

use anyhow::{bail, Context, Result};

use knock_core::Keypair;

/// Load the keypair at `path`, generating and saving one on first run.
pub fn load_or_generate(path: &Path) -> Result<Keypair> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let keypair = parse(&text).with_context(|| format!("bad keypair file {}", path.display()))?;
        tracing::info!(path = %path.display(), "keypair loaded");
        return Ok(keypair);
    }

    let keypair = Keypair::generate();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, hex::encode(*keypair.private_bytes()))
        .with_context(|| format!("failed to write {}", path.display()))?;
    restrict_permissions(path)?;
    tracing::info!(path = %path.display(), "keypair generated");
    Ok(keypair)
}

fn parse(text: &str) -> Result<Keypair> {
    let bytes = hex::decode(text.trim()).context("not hex")?;
    let Ok(private) = <[u8; 32]>::try_from(bytes.as_slice()) else {
        bail!("expected 32 bytes, got {}", bytes.len());
    };
    Ok(Keypair::from_private(private))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to restrict {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
