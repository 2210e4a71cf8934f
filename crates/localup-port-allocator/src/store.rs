//! Persisted port map
//!
//! The map is a flat text file with one `"<client_key> <port>"` record per
//! line. It is loaded once at startup and rewritten whole after every
//! mutating decision.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex_lite::Regex;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::range::PortRange;
use crate::table::{AllocationTable, ClientKey};

/// Default file name of the persisted port map
pub const DEFAULT_MAP_FILE: &str = "ports.map";

const RECORD_PATTERN: &str = r"^(\S+) ([0-9]+)$";

static RECORD: OnceLock<Regex> = OnceLock::new();

fn record_pattern() -> &'static Regex {
    RECORD.get_or_init(|| Regex::new(RECORD_PATTERN).expect("record pattern is valid"))
}

/// Durable backing for the allocation table
pub trait AllocationStore: Send + Sync {
    /// Load the persisted table, keeping only records that fit `range`
    fn load(&self, range: &PortRange) -> Result<AllocationTable, StoreError>;

    /// Replace the persisted table with `table`
    fn save(&self, table: &AllocationTable) -> Result<(), StoreError>;
}

/// Port map stored in a plain text file
pub struct FilePortStore {
    path: PathBuf,
}

impl FilePortStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn read_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Read {
            path: self.path.clone(),
            source,
        }
    }

    fn write_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Write {
            path: self.path.clone(),
            source,
        }
    }
}

impl AllocationStore for FilePortStore {
    fn load(&self, range: &PortRange) -> Result<AllocationTable, StoreError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(
                    "No cached port mapping found at {:?}, starting empty",
                    self.path
                );
                return Ok(AllocationTable::new());
            }
            Err(e) => return Err(self.read_error(e)),
        };

        info!("Reading cached port mapping from {:?}", self.path);

        let record = record_pattern();
        let mut table = AllocationTable::new();

        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| self.read_error(e))?;
            let line = line.trim_end_matches('\r');

            let Some(caps) = record.captures(line) else {
                warn!("Skipping malformed port map line: '{}'", line);
                continue;
            };
            let key = ClientKey::from_raw(&caps[1]);

            let port = match caps[2].parse::<u16>() {
                Ok(port) if range.contains(port) => port,
                _ => {
                    warn!(
                        "Found port {} for {} but it is outside the allowed range {}, skipping",
                        &caps[2], key, range
                    );
                    continue;
                }
            };

            if let Some(owner) = table.owner_of(port) {
                if *owner != key {
                    warn!(
                        "Port {} for {} is already claimed by {}, skipping",
                        port, key, owner
                    );
                    continue;
                }
            }

            info!("Found port {} for {}", port, key);
            table.assign(key, port);
        }

        info!("Loaded {} cached port allocations", table.len());
        Ok(table)
    }

    fn save(&self, table: &AllocationTable) -> Result<(), StoreError> {
        let temp_path = self.temp_path();

        let file = File::create(&temp_path).map_err(|e| self.write_error(e))?;
        let mut writer = BufWriter::new(file);
        for (key, port) in table.iter() {
            writeln!(writer, "{} {}", key, port).map_err(|e| self.write_error(e))?;
        }

        let file = writer
            .into_inner()
            .map_err(|e| self.write_error(e.into_error()))?;
        file.sync_all().map_err(|e| self.write_error(e))?;
        drop(file);

        fs::rename(&temp_path, &self.path).map_err(|e| self.write_error(e))?;

        debug!("Saved {} port allocations to {:?}", table.len(), self.path);
        Ok(())
    }
}
