//! OpenRouter API key lookup
//!
//! Checked in order: `OPENROUTER_API_KEY`, the OS keyring, then a 0600
//! file in the config directory for hosts without a keyring daemon.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

const KEYRING_SERVICE: &str = "postline";
const KEYRING_USER: &str = "openrouter";
const KEY_FILE: &str = "openrouter.key";

/// Where a key was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Env,
    Keyring,
    File,
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeySource::Env => API_KEY_ENV,
            KeySource::Keyring => "OS keyring",
            KeySource::File => "key file",
        })
    }
}

fn key_file() -> Result<PathBuf> {
    Ok(crate::config::config_dir()?.join(KEY_FILE))
}

fn keyring_entry() -> Option<keyring::Entry> {
    keyring::Entry::new(KEYRING_SERVICE, KEYRING_USER)
        .map_err(|e| debug!("Keyring unavailable: {}", e))
        .ok()
}

/// Trimmed, or None when blank
fn usable(raw: &str) -> Option<String> {
    let key = raw.trim();
    (!key.is_empty()).then(|| key.to_string())
}

/// The key and where it came from
pub fn find_api_key() -> Option<(String, KeySource)> {
    if let Some(key) = std::env::var(API_KEY_ENV).ok().as_deref().and_then(usable) {
        return Some((key, KeySource::Env));
    }
    if let Some(key) = keyring_entry()
        .and_then(|entry| entry.get_password().ok())
        .as_deref()
        .and_then(usable)
    {
        return Some((key, KeySource::Keyring));
    }
    let path = key_file().ok()?;
    fs::read_to_string(path)
        .ok()
        .as_deref()
        .and_then(usable)
        .map(|key| (key, KeySource::File))
}

pub fn get_api_key() -> Result<String> {
    match find_api_key() {
        Some((key, _)) => Ok(key),
        None => bail!(
            "No OpenRouter API key. Set {} or run 'postline config --set-api-key <key>'",
            API_KEY_ENV
        ),
    }
}

/// Store in the keyring when possible, the key file otherwise
pub fn set_api_key(raw: &str) -> Result<KeySource> {
    let Some(key) = usable(raw) else {
        bail!("API key is empty");
    };
    if let Some(entry) = keyring_entry() {
        match entry.set_password(&key) {
            Ok(()) => return Ok(KeySource::Keyring),
            Err(e) => warn!("Keyring write failed, using the key file: {}", e),
        }
    }

    let path = key_file()?;
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    fs::write(&path, &key).with_context(|| format!("Failed to write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .context("Failed to restrict key file permissions")?;
    }
    Ok(KeySource::File)
}

/// Remove the key from both stores; the environment is left alone
pub fn delete_api_key() -> Result<()> {
    if let Some(entry) = keyring_entry() {
        if let Err(e) = entry.delete_credential() {
            debug!("No keyring entry removed: {}", e);
        }
    }
    let path = key_file()?;
    if path.exists() {
        fs::remove_file(&path).with_context(|| format!("Failed to remove {}", path.display()))?;
    }
    Ok(())
}
