//! Content-addressed storage for shared configuration pairs
//!
//! A pair is stored under a short name derived from its bytes: the first 10
//! characters of the URL-safe base64 SHA-1 of the pair's canonical JSON
//! encoding. Saving the same pair twice yields the same name and leaves the
//! stored record untouched.
//!
//! Records are written to a temp file in the share directory and renamed
//! into place, so readers and concurrent writers never see a torn record.
//! Two different pairs landing on the same short name is an accepted risk;
//! the store refuses to overwrite the existing record in that case.

use crate::error::PlaygroundError;
use crate::pair::ConfigurationPair;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Length of a share name
pub const NAME_LEN: usize = 10;

/// Derives the share name for a pair
pub type Namer = fn(&ConfigurationPair) -> String;

/// Content address of a pair
pub fn content_name(pair: &ConfigurationPair) -> String {
    let encoded = serde_json::to_vec(pair).expect("configuration pair serializes to JSON");
    let digest = Sha1::digest(&encoded);
    let mut name = URL_SAFE.encode(digest);
    name.truncate(NAME_LEN);
    name
}

/// Whether `name` has the shape of a share name. Anything else is never
/// looked up on disk.
pub fn is_valid_name(name: &str) -> bool {
    name.len() == NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// On-disk record. `conf` may be absent in older records; loads then fall
/// back to the default gateway config.
#[derive(Debug, Serialize, Deserialize)]
struct ShareRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    conf: Option<String>,
    def: String,
}

impl ShareRecord {
    fn holds(&self, pair: &ConfigurationPair) -> bool {
        self.def == pair.def && self.conf.as_deref() == Some(pair.conf.as_str())
    }
}

/// Filesystem-backed share store
pub struct ShareStore {
    dir: PathBuf,
    namer: Namer,
    fallback_conf: Option<String>,
}

impl ShareStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            namer: content_name,
            fallback_conf: None,
        }
    }

    /// Gateway config used for records that only carry a definition
    pub fn with_fallback_conf(mut self, conf: impl Into<String>) -> Self {
        self.fallback_conf = Some(conf.into());
        self
    }

    /// Replace the naming function (used to force collisions in tests)
    pub fn with_namer(mut self, namer: Namer) -> Self {
        self.namer = namer;
        self
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    /// Persist a pair and return its share name
    pub async fn save(&self, pair: &ConfigurationPair) -> Result<String, PlaygroundError> {
        let name = (self.namer)(pair);
        if !is_valid_name(&name) {
            return Err(PlaygroundError::Storage(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid share name '{}'", name),
            )));
        }

        let dir = self.dir.clone();
        let path = self.record_path(&name);
        let pair = pair.clone();
        let record_name = name.clone();

        tokio::task::spawn_blocking(move || write_record(&dir, &path, &record_name, &pair))
            .await
            .map_err(|e| PlaygroundError::Storage(io::Error::new(io::ErrorKind::Other, e)))??;

        Ok(name)
    }

    /// Load a shared pair. The definition is mandatory; a missing gateway
    /// config is replaced by the fallback config when one is set.
    pub async fn load(&self, name: &str) -> Result<ConfigurationPair, PlaygroundError> {
        if !is_valid_name(name) {
            return Err(PlaygroundError::NotFound(name.to_string()));
        }

        let path = self.record_path(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PlaygroundError::NotFound(name.to_string()));
            }
            Err(e) => return Err(PlaygroundError::Storage(e)),
        };

        let record = parse_record(&bytes)?;
        let conf = match (record.conf, &self.fallback_conf) {
            (Some(conf), _) => conf,
            (None, Some(fallback)) => {
                debug!(name, "Shared record has no gateway config, using default");
                fallback.clone()
            }
            (None, None) => {
                return Err(PlaygroundError::Storage(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("share '{}' has no gateway config and no default is set", name),
                )));
            }
        };

        Ok(ConfigurationPair {
            conf,
            def: record.def,
        })
    }
}

fn parse_record(bytes: &[u8]) -> Result<ShareRecord, PlaygroundError> {
    serde_json::from_slice(bytes)
        .map_err(|e| PlaygroundError::Storage(io::Error::new(io::ErrorKind::InvalidData, e)))
}

fn write_record(
    dir: &Path,
    path: &Path,
    name: &str,
    pair: &ConfigurationPair,
) -> Result<(), PlaygroundError> {
    std::fs::create_dir_all(dir)?;

    match std::fs::read(path) {
        Ok(existing) => {
            if parse_record(&existing)?.holds(pair) {
                debug!(name, "Share already stored");
                return Ok(());
            }
            warn!(name, "Share name collision, keeping the existing record");
            return Err(PlaygroundError::ShareCollision(name.to_string()));
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(PlaygroundError::Storage(e)),
    }

    let record = ShareRecord {
        conf: Some(pair.conf.clone()),
        def: pair.def.clone(),
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, &record).map_err(io::Error::from)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    info!(name, path = %path.display(), "Share stored");
    Ok(())
}
