//! Certificate Database Module
//!
//! The CA's record of issued certificates, kept in the OpenSSL `ca` layout so
//! an OpenSSL OCSP responder can serve the same index:
//!
//! ```text
//! <CAPATH>/index.txt        V<TAB>YYMMDDHHMMSSZ<TAB><TAB>SERIAL<TAB>unknown<TAB>/C=../CN=..
//! <CAPATH>/serial           next serial, uppercase hex
//! <CAPATH>/newcerts/01.pem  issued certificates keyed by serial
//! ```
//!
//! The index is append-only. Readers take a shared advisory lock and
//! issuers an exclusive one on `<index>.lock`, so concurrent enrollment
//! workers never observe a torn index or issue twice for one subject.

use crate::error::{io_error, tool, EnrollError, EnrollResult};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use openssl::bn::{BigNum, BigNumRef};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

const FIRST_SERIAL: &str = "01";
const STATUS_VALID: &str = "V";

/// One parsed line of the index file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub status: String,
    pub expiry: String,
    pub serial: String,
    pub subject: String,
}

impl IndexEntry {
    fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 6 {
            return None;
        }
        Some(Self {
            status: fields[0].to_string(),
            expiry: fields[1].to_string(),
            serial: fields[3].to_string(),
            subject: fields[5].trim_end().to_string(),
        })
    }

    fn to_line(&self) -> String {
        format!(
            "{}\t{}\t\t{}\tunknown\t{}\n",
            self.status, self.expiry, self.serial, self.subject
        )
    }
}

/// Format a timestamp the way the OpenSSL index stores expiry dates.
pub fn index_time(time: DateTime<Utc>) -> String {
    time.format("%y%m%d%H%M%SZ").to_string()
}

/// Handle on a CA certificate database.
#[derive(Debug, Clone)]
pub struct CertDatabase {
    index: PathBuf,
    certs_dir: PathBuf,
    serial: PathBuf,
}

impl CertDatabase {
    /// Open an existing database.
    ///
    /// # Errors
    /// `NotFound` if the index is not a file or the certificate storage is not
    /// a directory.
    pub fn open(index: &Path, certs_dir: &Path, serial: &Path) -> EnrollResult<Self> {
        if !index.is_file() {
            return Err(EnrollError::NotFound(format!(
                "certificate database \"{}\" is not a file",
                index.display()
            )));
        }
        if !certs_dir.is_dir() {
            return Err(EnrollError::NotFound(format!(
                "certificate storage \"{}\" is not a directory",
                certs_dir.display()
            )));
        }
        Ok(Self {
            index: index.to_path_buf(),
            certs_dir: certs_dir.to_path_buf(),
            serial: serial.to_path_buf(),
        })
    }

    /// Create an empty database. Refuses to overwrite an existing index.
    pub fn init(index: &Path, certs_dir: &Path, serial: &Path) -> EnrollResult<Self> {
        if index.exists() {
            return Err(EnrollError::config(format!(
                "certificate database \"{}\" already exists",
                index.display()
            )));
        }
        if let Some(parent) = index.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(io_error(format!("Failed to create {}", parent.display())))?;
        }
        fs::create_dir_all(certs_dir)
            .map_err(io_error(format!("Failed to create {}", certs_dir.display())))?;
        File::create(index).map_err(io_error(format!("Failed to create {}", index.display())))?;
        if !serial.exists() {
            fs::write(serial, format!("{}\n", FIRST_SERIAL))
                .map_err(io_error(format!("Failed to write {}", serial.display())))?;
        }
        Self::open(index, certs_dir, serial)
    }

    pub fn index_path(&self) -> &Path {
        &self.index
    }

    /// Look up the certificate issued for `subject`.
    ///
    /// # Returns
    /// * `Ok(Some(path))` - a valid entry exists and its file is present
    /// * `Ok(None)` - no valid entry for the subject
    ///
    /// # Errors
    /// `NotFound` when the index references a certificate file that is missing.
    pub fn find(&self, subject: &str) -> EnrollResult<Option<PathBuf>> {
        let lock = self.lock_file()?;
        lock.lock_shared()
            .map_err(io_error(format!("Failed to lock {}", self.index.display())))?;
        self.find_unlocked(subject)
    }

    /// Begin an exclusive lookup-then-issue sequence.
    ///
    /// The lock is released when the returned transaction is dropped.
    pub fn transaction(&self) -> EnrollResult<DbTransaction<'_>> {
        let lock = self.lock_file()?;
        lock.lock_exclusive()
            .map_err(io_error(format!("Failed to lock {}", self.index.display())))?;
        debug!(index = %self.index.display(), "certificate database locked");
        Ok(DbTransaction { db: self, _lock: lock })
    }

    /// All parsed index entries, in file order.
    pub fn entries(&self) -> EnrollResult<Vec<IndexEntry>> {
        let text = fs::read_to_string(&self.index)
            .map_err(io_error(format!("Failed to read {}", self.index.display())))?;
        Ok(text.lines().filter_map(IndexEntry::parse).collect())
    }

    fn find_unlocked(&self, subject: &str) -> EnrollResult<Option<PathBuf>> {
        let entry = self
            .entries()?
            .into_iter()
            .find(|entry| entry.status == STATUS_VALID && entry.subject == subject);
        let Some(entry) = entry else {
            return Ok(None);
        };
        let path = self.cert_file(&entry.serial);
        if !path.is_file() {
            return Err(EnrollError::NotFound(format!(
                "certificate {} for \"{}\" is indexed but missing from \"{}\"",
                entry.serial,
                subject,
                self.certs_dir.display()
            )));
        }
        Ok(Some(path))
    }

    fn cert_file(&self, serial: &str) -> PathBuf {
        self.certs_dir.join(format!("{}.pem", serial))
    }

    fn lock_file(&self) -> EnrollResult<File> {
        let mut name = self.index.clone().into_os_string();
        name.push(".lock");
        OpenOptions::new()
            .create(true)
            .write(true)
            .open(&name)
            .map_err(io_error(format!(
                "Failed to open lock file {}",
                PathBuf::from(&name).display()
            )))
    }
}

/// Exclusive access to the database for one issuance.
pub struct DbTransaction<'a> {
    db: &'a CertDatabase,
    _lock: File,
}

impl DbTransaction<'_> {
    pub fn find(&self, subject: &str) -> EnrollResult<Option<PathBuf>> {
        self.db.find_unlocked(subject)
    }

    /// Serial to assign to the next certificate.
    pub fn next_serial(&self) -> EnrollResult<BigNum> {
        let text = match fs::read_to_string(&self.db.serial) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FIRST_SERIAL.to_string(),
            Err(e) => {
                return Err(io_error(format!("Failed to read {}", self.db.serial.display()))(e))
            }
        };
        let text = match text.trim() {
            "" => FIRST_SERIAL,
            serial => serial,
        };
        BigNum::from_hex_str(text).map_err(tool(format!(
            "Serial file {} is not hexadecimal",
            self.db.serial.display()
        )))
    }

    /// Store an issued certificate and append its index entry.
    ///
    /// The certificate file is written before the index line so the index
    /// never references a file that does not exist.
    ///
    /// # Returns
    /// Path of the stored certificate.
    pub fn record(
        &self,
        serial: &BigNum,
        cert_pem: &[u8],
        subject: &str,
        expiry: &str,
    ) -> EnrollResult<PathBuf> {
        let serial_hex = serial
            .to_hex_str()
            .map_err(tool("Failed to format serial"))?
            .to_string();
        let path = self.db.cert_file(&serial_hex);
        fs::write(&path, cert_pem).map_err(io_error(format!("Failed to write {}", path.display())))?;

        let entry = IndexEntry {
            status: STATUS_VALID.to_string(),
            expiry: expiry.to_string(),
            serial: serial_hex.clone(),
            subject: subject.to_string(),
        };
        let mut index = OpenOptions::new()
            .append(true)
            .open(&self.db.index)
            .map_err(io_error(format!("Failed to open {}", self.db.index.display())))?;
        index
            .write_all(entry.to_line().as_bytes())
            .map_err(io_error(format!("Failed to append to {}", self.db.index.display())))?;

        let mut next = BigNumRef::to_owned(serial).map_err(tool("Failed to copy serial"))?;
        next.add_word(1).map_err(tool("Failed to increment serial"))?;
        let next_hex = next.to_hex_str().map_err(tool("Failed to format serial"))?;
        fs::write(&self.db.serial, format!("{}\n", &*next_hex))
            .map_err(io_error(format!("Failed to write {}", self.db.serial.display())))?;

        debug!(serial = %serial_hex, subject, "certificate recorded");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_db(dir: &TempDir) -> CertDatabase {
        CertDatabase::init(
            &dir.path().join("index.txt"),
            &dir.path().join("newcerts"),
            &dir.path().join("serial"),
        )
        .unwrap()
    }

    #[test]
    fn test_record_and_find() {
        let dir = TempDir::new().unwrap();
        let db = new_db(&dir);
        let subject = "/C=AU/O=Data61/CN=sensor-01";

        assert!(db.find(subject).unwrap().is_none());
        let path = {
            let tx = db.transaction().unwrap();
            let serial = tx.next_serial().unwrap();
            assert_eq!(serial.to_hex_str().unwrap().to_string(), "01");
            tx.record(&serial, b"PEM", subject, "350101000000Z").unwrap()
        };

        assert_eq!(path, dir.path().join("newcerts").join("01.pem"));
        assert_eq!(db.find(subject).unwrap(), Some(path));
        assert_eq!(fs::read_to_string(dir.path().join("serial")).unwrap(), "02\n");

        let entries = db.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].serial, "01");
        assert_eq!(entries[0].subject, subject);
    }

    #[test]
    fn test_subject_match_is_exact() {
        let dir = TempDir::new().unwrap();
        let db = new_db(&dir);
        {
            let tx = db.transaction().unwrap();
            let serial = tx.next_serial().unwrap();
            tx.record(&serial, b"PEM", "/CN=dev10", "350101000000Z").unwrap();
        }
        assert!(db.find("/CN=dev1").unwrap().is_none());
        assert!(db.find("/CN=dev10").unwrap().is_some());
    }

    #[test]
    fn test_revoked_entries_are_not_reused() {
        let dir = TempDir::new().unwrap();
        let db = new_db(&dir);
        fs::write(
            db.index_path(),
            "R\t350101000000Z\t250101000000Z\t01\tunknown\t/CN=old\n",
        )
        .unwrap();
        fs::write(dir.path().join("newcerts").join("01.pem"), b"PEM").unwrap();
        assert!(db.find("/CN=old").unwrap().is_none());
    }

    #[test]
    fn test_missing_certificate_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let db = new_db(&dir);
        fs::write(db.index_path(), "V\t350101000000Z\t\t0A\tunknown\t/CN=ghost\n").unwrap();
        assert!(matches!(db.find("/CN=ghost"), Err(EnrollError::NotFound(_))));
    }

    #[test]
    fn test_open_invalid_paths() {
        let dir = TempDir::new().unwrap();
        let result = CertDatabase::open(
            &dir.path().join("index.txt"),
            &dir.path().join("newcerts"),
            &dir.path().join("serial"),
        );
        assert!(matches!(result, Err(EnrollError::NotFound(_))));
    }

    #[test]
    fn test_init_refuses_existing_index() {
        let dir = TempDir::new().unwrap();
        new_db(&dir);
        let result = CertDatabase::init(
            &dir.path().join("index.txt"),
            &dir.path().join("newcerts"),
            &dir.path().join("serial"),
        );
        assert!(matches!(result, Err(EnrollError::Config(_))));
    }

    #[test]
    fn test_index_time_format() {
        let time = DateTime::parse_from_rfc3339("2035-03-04T05:06:07Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(index_time(time), "350304050607Z");
    }
}
