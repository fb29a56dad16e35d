use anyhow::{Context, Result};
use rand::TryRngCore;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";

/// Argon2id cost parameters for deriving the secret cipher key.
#[derive(Debug, Clone, Copy)]
pub struct KdfParams {
    pub m_cost_kib: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost_kib: 19 * 1024,
            t_cost: 2,
            p_cost: 1,
        }
    }
}

/// Material the secret cipher key is derived from.
#[derive(Clone)]
pub struct CipherConfig {
    pub secret: String,
    pub salt: Vec<u8>,
    pub kdf: KdfParams,
}

impl CipherConfig {
    #[cfg(test)]
    pub fn for_tests(secret: &str) -> Self {
        Self {
            secret: secret.to_string(),
            salt: b"unit-test-salt-0".to_vec(),
            kdf: KdfParams {
                m_cost_kib: 1024,
                t_cost: 1,
                p_cost: 1,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub default_timeout: Duration,
    pub default_api_key_header: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            default_api_key_header: DEFAULT_API_KEY_HEADER.to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        if timeout_ms > 0 {
            self.default_timeout = Duration::from_millis(timeout_ms);
        }
        self
    }

    /// Zero or absent means "use the engine default".
    pub fn effective_timeout(&self, timeout_ms: Option<u64>) -> Duration {
        match timeout_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            _ => self.default_timeout,
        }
    }
}

pub fn get_app_dir(override_dir: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = override_dir {
        return Ok(dir.to_path_buf());
    }
    let base_dir = dirs::config_dir()
        .context("Failed to resolve config directory")?
        .join("api-gateway");

    Ok(base_dir)
}

pub fn get_db_path(app_dir: &Path) -> PathBuf {
    app_dir.join("api-gateway.db")
}

pub fn init_directories(app_dir: &Path) -> Result<()> {
    if !app_dir.exists() {
        fs::create_dir_all(app_dir).context("Failed to create data directory")?;
        tracing::info!("Created data directory: {}", app_dir.display());
    }
    Ok(())
}

/// Builds the cipher configuration. An explicitly supplied secret wins;
/// otherwise a random master secret is generated once and kept in the data
/// directory. There is no built-in fallback key.
pub fn load_cipher_config(app_dir: &Path, explicit_secret: Option<String>) -> Result<CipherConfig> {
    let salt = load_or_create_random(&app_dir.join("kdf.salt"), 16)
        .context("Failed to load KDF salt")?;

    let secret = match explicit_secret.filter(|s| !s.trim().is_empty()) {
        Some(secret) => secret,
        None => {
            let key_path = app_dir.join("master.key");
            if !key_path.exists() {
                tracing::warn!(
                    "No encryption key configured, generating one at {}",
                    key_path.display()
                );
            }
            hex::encode(load_or_create_random(&key_path, 32).context("Failed to load master key")?)
        }
    };

    Ok(CipherConfig {
        secret,
        salt,
        kdf: KdfParams::default(),
    })
}

fn load_or_create_random(path: &Path, len: usize) -> Result<Vec<u8>> {
    if path.exists() {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let bytes = hex::decode(contents.trim())
            .with_context(|| format!("Failed to decode {}", path.display()))?;
        if bytes.len() != len {
            return Err(anyhow::anyhow!(
                "{} must hold {} bytes, found {}",
                path.display(),
                len,
                bytes.len()
            ));
        }
        return Ok(bytes);
    }

    let mut bytes = vec![0u8; len];
    let mut rng = rand::rngs::OsRng;
    rng.try_fill_bytes(&mut bytes)
        .context("Failed to generate random bytes")?;

    let mut file = fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(hex::encode(&bytes).as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perms)
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    tracing::info!("Created {}", path.display());
    Ok(bytes)
}
