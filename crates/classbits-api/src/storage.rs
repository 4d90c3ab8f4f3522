use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use classbits_types::models::ProofMeta;

/// 10 MiB upload limit for proof files
pub const MAX_PROOF_SIZE: usize = 10 * 1024 * 1024;

/// On-disk storage for siphon proof files.
///
/// Each proof is stored flat at `{dir}/{uuid}.{ext}`. The client-supplied
/// file name is kept only as metadata and never touches the filesystem.
pub struct ProofStorage {
    dir: PathBuf,
}

impl ProofStorage {
    pub async fn new(dir: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("Proof storage directory: {}", dir.display());
        Ok(Self { dir })
    }

    /// Write `bytes` under a fresh name and return its metadata, including
    /// the SHA-256 of what was written.
    pub async fn save(&self, original_name: &str, mime_type: &str, bytes: &[u8]) -> io::Result<ProofMeta> {
        let stored_name = match safe_extension(original_name) {
            Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
            None => Uuid::new_v4().to_string(),
        };

        let path = self.dir.join(&stored_name);
        let mut file = fs::File::create(&path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;

        let sha256 = hex::encode(Sha256::digest(bytes));
        info!("Stored proof {} ({} bytes)", stored_name, bytes.len());

        Ok(ProofMeta {
            original_name: display_name(original_name),
            stored_name,
            mime_type: if mime_type.is_empty() {
                "application/octet-stream".to_string()
            } else {
                mime_type.to_string()
            },
            size: bytes.len() as u64,
            sha256,
        })
    }

    pub async fn open(&self, stored_name: &str) -> io::Result<fs::File> {
        fs::File::open(self.path_of(stored_name)?).await
    }

    pub async fn delete(&self, stored_name: &str) -> io::Result<()> {
        match fs::remove_file(self.path_of(stored_name)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Proof {} already gone", stored_name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Stored names come from the database, but refuse anything that could
    /// leave the storage directory anyway.
    fn path_of(&self, stored_name: &str) -> io::Result<PathBuf> {
        let valid = !stored_name.is_empty()
            && stored_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            && !stored_name.starts_with('.');
        if !valid {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid stored proof name '{}'", stored_name),
            ));
        }
        Ok(self.dir.join(stored_name))
    }
}

fn safe_extension(name: &str) -> Option<String> {
    let ext = Path::new(name).extension()?.to_str()?;
    (!ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .then(|| ext.to_ascii_lowercase())
}

/// Last path component, without control characters or quotes so it can go
/// into a Content-Disposition header.
fn display_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base.chars().filter(|c| !c.is_control() && *c != '"').collect();
    if cleaned.trim().is_empty() {
        "proof".to_string()
    } else {
        cleaned
    }
}
