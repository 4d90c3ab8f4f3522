use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, bail};

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub proof_dir: PathBuf,
    pub jwt_secret: String,
    /// Seconds between expiry sweeps; 0 turns the sweep off.
    pub expiry_sweep_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = get("CLASSBITS_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("CLASSBITS_JWT_SECRET is unset or still a placeholder; set it in your .env file");
        }

        let host = get("CLASSBITS_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = get("CLASSBITS_PORT")
            .unwrap_or_else(|| "3000".into())
            .parse()
            .context("CLASSBITS_PORT must be a port number")?;
        let addr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", host, port))?;

        let expiry_sweep_secs = match get("CLASSBITS_EXPIRY_SWEEP_SECS") {
            Some(raw) => raw
                .parse()
                .context("CLASSBITS_EXPIRY_SWEEP_SECS must be a whole number of seconds")?,
            None => 3600,
        };

        Ok(Self {
            addr,
            db_path: get("CLASSBITS_DB_PATH").unwrap_or_else(|| "classbits.db".into()).into(),
            proof_dir: get("CLASSBITS_PROOF_DIR").unwrap_or_else(|| "./proofs".into()).into(),
            jwt_secret,
            expiry_sweep_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_the_secret_is_set() {
        let config = load(&[("CLASSBITS_JWT_SECRET", "s3cr3t")]).unwrap();
        assert_eq!(config.addr, "0.0.0.0:3000".parse().unwrap());
        assert_eq!(config.db_path, PathBuf::from("classbits.db"));
        assert_eq!(config.proof_dir, PathBuf::from("./proofs"));
        assert_eq!(config.expiry_sweep_secs, 3600);
    }

    #[test]
    fn placeholder_or_missing_secret_is_fatal() {
        assert!(load(&[]).is_err());
        assert!(load(&[("CLASSBITS_JWT_SECRET", "dev-secret-change-me")]).is_err());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("CLASSBITS_JWT_SECRET", "s3cr3t"),
            ("CLASSBITS_HOST", "127.0.0.1"),
            ("CLASSBITS_PORT", "8080"),
            ("CLASSBITS_EXPIRY_SWEEP_SECS", "0"),
        ])
        .unwrap();
        assert_eq!(config.addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.expiry_sweep_secs, 0);

        assert!(load(&[("CLASSBITS_JWT_SECRET", "s3cr3t"), ("CLASSBITS_PORT", "http")]).is_err());
    }
}
