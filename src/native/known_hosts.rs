//! Known hosts management for SSH host key verification
//!
//! Reads and appends OpenSSH `known_hosts` files. One store is built per
//! check so that edits made by other tools between checks are seen.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use md5::Md5;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches known_hosts entry
    Verified,
    /// Host not in known_hosts (first connection)
    Unknown { fingerprint: String },
    /// Key changed from known_hosts entry (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
    /// Host is known, but only with keys of other types
    FoundOther { known_types: Vec<String> },
}

/// Entry in known_hosts: (key_type, base64_key)
#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

pub struct KnownHostsStore {
    /// host (or `[host]:port`) -> keys, several key types per host allowed
    hosts: HashMap<String, Vec<HostKeyEntry>>,
    path: PathBuf,
}

impl KnownHostsStore {
    /// Load the file at `path`
    ///
    /// A missing file is an error here; callers map it to "file not found".
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let mut store = Self {
            hosts: HashMap::new(),
            path: path.into(),
        };
        store.load()?;
        Ok(store)
    }

    /// Store for a file that may not exist yet (for appending)
    pub fn open_or_empty(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::open(&path).unwrap_or_else(|e| {
            debug!("Known hosts file {} not loaded: {}", path.display(), e);
            Self {
                hosts: HashMap::new(),
                path,
            }
        })
    }

    fn load(&mut self) -> std::io::Result<()> {
        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut entry_count = 0;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();

            // Skip empty lines and comments
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // Parse: hostname[,alias] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 || parts[0].starts_with('@') {
                continue;
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                // Hashed hostnames (|1|...) are not matched
                if hostname.starts_with('|') {
                    continue;
                }
                self.hosts
                    .entry(Self::normalize_hostname(hostname))
                    .or_default()
                    .push(entry.clone());
                entry_count += 1;
            }
        }

        debug!(
            "Loaded {} known host entries ({} unique hosts) from {}",
            entry_count,
            self.hosts.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Normalize hostname for lookup: lowercase, and `[host]:22` -> `host`
    fn normalize_hostname(host: &str) -> String {
        let host = host.to_lowercase();
        match host.strip_prefix('[').and_then(|h| h.split_once("]:")) {
            Some((name, "22")) => name.to_string(),
            Some(_) => host,
            None => host.trim_end_matches(']').to_string(),
        }
    }

    /// Create lookup key for host:port
    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// Compute SHA256 fingerprint of public key
    pub fn fingerprint(key: &PublicKey) -> String {
        Self::fingerprint_bytes(&key.public_key_bytes())
    }

    fn fingerprint_bytes(bytes: &[u8]) -> String {
        let hash = Sha256::digest(bytes);
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    /// MD5 digest of the key blob
    pub fn md5_hash(key: &PublicKey) -> Vec<u8> {
        Md5::digest(key.public_key_bytes()).to_vec()
    }

    /// Verify a host's public key
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let actual_key_b64 = BASE64.encode(key.public_key_bytes());
        let actual_key_type = key.algorithm().as_str().to_string();
        let fingerprint = Self::fingerprint(key);

        let Some(entries) = self.hosts.get(&lookup_key) else {
            debug!("Unknown host: {}", lookup_key);
            return HostKeyVerification::Unknown { fingerprint };
        };

        let mut expected = None;
        for entry in entries.iter().filter(|e| e.key_type == actual_key_type) {
            if entry.key_data == actual_key_b64 {
                debug!("Host key verified for {} (type: {})", lookup_key, actual_key_type);
                return HostKeyVerification::Verified;
            }
            expected.get_or_insert(&entry.key_data);
        }

        if let Some(stored) = expected {
            let expected_fingerprint = Self::compute_fingerprint_from_b64(stored);
            warn!(
                "HOST KEY CHANGED for {} (type: {})! Expected {}, got {}",
                lookup_key, actual_key_type, expected_fingerprint, fingerprint
            );
            return HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint: fingerprint,
            };
        }

        let known_types = entries.iter().map(|e| e.key_type.clone()).collect();
        warn!(
            "Host {} known with other key types, none of type {}",
            lookup_key, actual_key_type
        );
        HostKeyVerification::FoundOther { known_types }
    }

    /// Compute fingerprint from stored base64 key
    fn compute_fingerprint_from_b64(stored_b64: &str) -> String {
        match BASE64.decode(stored_b64) {
            Ok(bytes) => Self::fingerprint_bytes(&bytes),
            Err(_) => "unknown".to_string(),
        }
    }

    /// Add a new host key, appending it to the file
    pub fn add_host(&mut self, host: &str, port: u16, key: &PublicKey) -> std::io::Result<()> {
        let lookup_key = Self::make_key(host, port);
        let key_b64 = BASE64.encode(key.public_key_bytes());
        let key_type = key.algorithm().as_str().to_string();

        self.append_to_file(&lookup_key, &key_type, &key_b64)?;
        self.hosts.entry(lookup_key.clone()).or_default().push(HostKeyEntry {
            key_type: key_type.clone(),
            key_data: key_b64,
        });

        info!(
            "Added host key for {} (type: {}) to {}",
            lookup_key,
            key_type,
            self.path.display()
        );
        Ok(())
    }

    fn append_to_file(&self, host: &str, key_type: &str, key_b64: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        writeln!(file, "{} {} {}", host, key_type, key_b64)
    }
}
