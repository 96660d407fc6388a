//! Configuration Module
//!
//! Line-oriented `KEY = "value"` configuration files and the typed,
//! per-instance views built from them. Every component receives its own
//! configuration value; nothing here is shared or global.

use crate::error::{io_error, EnrollError, EnrollResult};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Default CA port used by both sides of the enrollment protocol.
pub const DEFAULT_CA_PORT: u16 = 12345;
const DEFAULT_CA_HOST: &str = "127.0.0.1";
const DEFAULT_SERVER_HOST: &str = "::1";
const DEFAULT_ISSUE_DAYS: u32 = 365;

/// Keys understood by the certificate manager.
pub const CERT_KEYS: &[&str] = &[
    "WORKPATH", "CAPATH", "C", "ST", "L", "O", "OU", "CN", "emailAddress", "SK", "CSR",
    "ECCPARAM", "SELFSIGN", "CERT", "CERTDB", "CERTS", "SERIAL", "CAKEY", "CACERT", "DAYS",
    "MSG", "SIG", "SIGCERT", "CACHAIN", "OCSP", "EXTENSIONS",
];

/// Keys understood by the CA server on top of [`CERT_KEYS`].
pub const CA_KEYS: &[&str] = &[
    "IP", "PORT", "CERT", "CSR", "MSG", "SIG", "CACERT", "CACHAIN", "OCSP", "OCSPPORT",
    "SIGCERT", "SIGCHAIN", "SELFSIGN", "SCRATCH",
];

/// Keys understood by the OCSP responder launcher.
pub const OCSP_KEYS: &[&str] = &["CACERT", "OCSPPORT", "OCSPCERT", "OCSPSK", "CERTDB", "OPENSSL_PATH"];

/// Keys understood by a device (client or server role).
pub const DEVICE_KEYS: &[&str] = &[
    "C", "ST", "L", "O", "OU", "CN", "emailAddress", "ECCPARAM", "CAIP", "CAPORT", "CERT",
    "CSR", "MSG", "SIG", "CACERT", "SK", "SERVERIP", "SERVERPORT", "CACHAIN", "TYPE",
    "CERT_REQS",
];

// ================= Config Store =================

/// A `KEY = "value"` configuration file held in memory.
///
/// Values are read from between the first pair of double quotes on a line;
/// a line without quotes yields an empty value, and a `#` in front of the key
/// disables the line. Keys that never appear read as the empty string.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
    dirty: BTreeSet<String>,
}

impl ConfigStore {
    /// Load a configuration file. The file must exist.
    pub fn load(path: impl AsRef<Path>) -> EnrollResult<Self> {
        let path = expand_home(path.as_ref());
        if !path.is_file() {
            return Err(EnrollError::config(format!(
                "configuration file \"{}\" doesn't exist or it is not a file",
                path.display()
            )));
        }
        let text = fs::read_to_string(&path)
            .map_err(io_error(format!("Failed to read config file: {}", path.display())))?;
        Ok(Self {
            path,
            values: parse_lines(&text),
            dirty: BTreeSet::new(),
        })
    }

    /// Build a store from text that is never persisted to a file.
    pub fn from_text(text: &str) -> Self {
        Self {
            path: PathBuf::new(),
            values: parse_lines(text),
            dirty: BTreeSet::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Value of `key`, or the empty string when unset.
    pub fn get(&self, key: &str) -> &str {
        self.values.get(key).map(String::as_str).unwrap_or("")
    }

    /// Filesystem path stored under `key`, with `~` expanded. `None` when unset.
    pub fn path_value(&self, key: &str) -> Option<PathBuf> {
        match self.get(key) {
            "" => None,
            value => Some(expand_home(Path::new(value))),
        }
    }

    /// Port number stored under `key`, falling back to `default` when unset.
    pub fn port_value(&self, key: &str, default: u16) -> EnrollResult<u16> {
        match self.get(key) {
            "" => Ok(default),
            value => value.parse().map_err(|_| {
                EnrollError::config(format!("\"{}\" is not a valid port for {}", value, key))
            }),
        }
    }

    /// Set a value in memory and mark it for the next [`persist`](Self::persist).
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() {
            return;
        }
        self.values.insert(key.to_string(), value);
        self.dirty.insert(key.to_string());
    }

    /// Apply `KEY=VALUE` runtime overrides restricted to `allowed` keys.
    ///
    /// # Returns
    /// The number of values changed.
    pub fn apply_overrides(&mut self, overrides: &[String], allowed: &[&str]) -> EnrollResult<usize> {
        let mut updated = 0;
        for item in overrides {
            let (key, value) = item.split_once('=').ok_or_else(|| {
                EnrollError::config(format!("override \"{}\" is not in KEY=VALUE form", item))
            })?;
            let key = key.trim();
            if !allowed.contains(&key) {
                return Err(EnrollError::config(format!("unknown configuration key \"{}\"", key)));
            }
            let value = value.trim();
            if !value.is_empty() && self.get(key) != value {
                self.set(key, value);
                updated += 1;
            }
        }
        Ok(updated)
    }

    /// Rewrite the backing file in place for every changed key.
    ///
    /// Matching lines (including disabled `#KEY` lines) are replaced by
    /// `KEY = "value"`; all other lines are left untouched. Changed keys with
    /// no line in the file are appended.
    pub fn persist(&mut self) -> EnrollResult<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        if self.path.as_os_str().is_empty() {
            return Err(EnrollError::config("configuration has no backing file"));
        }
        let text = fs::read_to_string(&self.path)
            .map_err(io_error(format!("Failed to read config file: {}", self.path.display())))?;

        let mut written = BTreeSet::new();
        let mut output = String::with_capacity(text.len());
        for line in text.lines() {
            let key = line
                .split_once('=')
                .map(|(key, _)| key.trim().trim_matches('#').trim());
            match key {
                Some(key) if self.dirty.contains(key) => {
                    output.push_str(&format!("{} = \"{}\"\n", key, self.get(key)));
                    written.insert(key.to_string());
                }
                _ => {
                    output.push_str(line);
                    output.push('\n');
                }
            }
        }
        for key in self.dirty.difference(&written) {
            output.push_str(&format!("{} = \"{}\"\n", key, self.get(key)));
        }

        fs::write(&self.path, output)
            .map_err(io_error(format!("Failed to write config file: {}", self.path.display())))?;
        self.dirty.clear();
        Ok(())
    }
}

fn parse_lines(text: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    for line in text.lines() {
        let Some((key, rest)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || key.starts_with('#') {
            continue;
        }
        let rest = rest.trim();
        let value = rest
            .find('"')
            .and_then(|begin| {
                let tail = &rest[begin + 1..];
                tail.find('"').map(|end| &tail[..end])
            })
            .unwrap_or("");
        values.insert(key.to_string(), value.to_string());
    }
    values
}

/// Expand a leading `~` to `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

// ================= Typed Views =================

/// Distinguished name fields of a certificate subject.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subject {
    pub country: String,
    pub state: String,
    pub locality: String,
    pub organization: String,
    pub organizational_unit: String,
    pub common_name: String,
    pub email: String,
}

impl Subject {
    fn from_store(store: &ConfigStore) -> Self {
        Self {
            country: store.get("C").to_string(),
            state: store.get("ST").to_string(),
            locality: store.get("L").to_string(),
            organization: store.get("O").to_string(),
            organizational_unit: store.get("OU").to_string(),
            common_name: store.get("CN").to_string(),
            email: store.get("emailAddress").to_string(),
        }
    }
}

/// Configuration of one certificate identity (device, CA or signer).
#[derive(Debug, Clone, Default)]
pub struct CertConfig {
    pub subject: Subject,
    /// Private key (`SK`).
    pub key_path: Option<PathBuf>,
    /// Named EC curve (`ECCPARAM`).
    pub curve: String,
    pub csr_path: Option<PathBuf>,
    /// `y` for a self-signed certificate, `n` for CA issuance.
    pub self_sign: String,
    /// Output certificate (`CERT`).
    pub cert_path: Option<PathBuf>,
    /// CA index file (`CERTDB`).
    pub cert_db: Option<PathBuf>,
    /// Directory of issued certificates (`CERTS`).
    pub certs_dir: Option<PathBuf>,
    pub serial_path: Option<PathBuf>,
    /// CA signing key used for issuance (`CAKEY`).
    pub ca_key: Option<PathBuf>,
    /// CA certificate used for issuance (`CACERT`).
    pub ca_cert: Option<PathBuf>,
    pub days: u32,
    pub msg_path: Option<PathBuf>,
    pub sig_path: Option<PathBuf>,
    /// Signer's certificate used to verify detached signatures (`SIGCERT`).
    pub signer_cert: Option<PathBuf>,
    pub ca_chain: Option<PathBuf>,
    pub ocsp_url: String,
    /// Extension profile applied on CA issuance.
    pub extensions: String,
}

impl CertConfig {
    /// Build the certificate manager view of a store.
    ///
    /// `CAPATH` fills in the CA database layout and `WORKPATH` fills in the
    /// identity's key, certificate, CSR, message and signature paths, each only
    /// where the explicit key is unset.
    pub fn from_store(store: &ConfigStore) -> EnrollResult<Self> {
        let days = match store.get("DAYS") {
            "" => DEFAULT_ISSUE_DAYS,
            value => value
                .parse()
                .map_err(|_| EnrollError::config(format!("DAYS \"{}\" is not a number", value)))?,
        };
        let mut config = Self {
            subject: Subject::from_store(store),
            key_path: store.path_value("SK"),
            curve: store.get("ECCPARAM").to_string(),
            csr_path: store.path_value("CSR"),
            self_sign: store.get("SELFSIGN").to_string(),
            cert_path: store.path_value("CERT"),
            cert_db: store.path_value("CERTDB"),
            certs_dir: store.path_value("CERTS"),
            serial_path: store.path_value("SERIAL"),
            ca_key: store.path_value("CAKEY"),
            ca_cert: store.path_value("CACERT"),
            days,
            msg_path: store.path_value("MSG"),
            sig_path: store.path_value("SIG"),
            signer_cert: store.path_value("SIGCERT"),
            ca_chain: store.path_value("CACHAIN"),
            ocsp_url: store.get("OCSP").to_string(),
            extensions: store.get("EXTENSIONS").trim().to_string(),
        };
        if let Some(ca_path) = store.path_value("CAPATH") {
            config.apply_ca_layout(&ca_path);
        }
        if let Some(work_path) = store.path_value("WORKPATH") {
            config.apply_work_layout(&work_path);
        }
        Ok(config)
    }

    /// Default the CA database paths to the classic CA directory layout.
    pub fn apply_ca_layout(&mut self, ca_path: &Path) {
        self.cert_db.get_or_insert_with(|| ca_path.join("index.txt"));
        self.certs_dir.get_or_insert_with(|| ca_path.join("newcerts"));
        self.ca_key.get_or_insert_with(|| ca_path.join("private").join("cakey.pem"));
        self.ca_cert.get_or_insert_with(|| ca_path.join("cacert.pem"));
    }

    /// Default the identity's own files to a working directory.
    pub fn apply_work_layout(&mut self, work_path: &Path) {
        let self_signed = self.self_sign.eq_ignore_ascii_case("y");
        let cn = self.subject.common_name.clone();
        self.cert_path.get_or_insert_with(|| {
            if self_signed {
                work_path.join("cacert.pem")
            } else {
                work_path.join(format!("{}.cert.pem", cn))
            }
        });
        self.key_path.get_or_insert_with(|| {
            if self_signed {
                work_path.join("private").join("cakey.pem")
            } else {
                work_path.join("private").join(format!("{}.key.pem", cn))
            }
        });
        self.csr_path.get_or_insert_with(|| work_path.join(format!("{}.csr", cn)));
        self.msg_path.get_or_insert_with(|| work_path.join("msg"));
        self.sig_path.get_or_insert_with(|| work_path.join("sig"));
    }

    /// Serial file, defaulting to `serial` next to the index.
    pub fn serial_file(&self) -> Option<PathBuf> {
        self.serial_path.clone().or_else(|| {
            self.cert_db
                .as_ref()
                .map(|db| db.parent().unwrap_or(Path::new("")).join("serial"))
        })
    }
}

/// CA server settings.
#[derive(Debug, Clone)]
pub struct CaConfig {
    pub ip: String,
    pub port: u16,
    /// Session-relative file names for the uploaded artifacts.
    pub csr_file: PathBuf,
    pub msg_file: PathBuf,
    pub sig_file: PathBuf,
    pub cert_file: PathBuf,
    /// The CA's own certificate, delivered after the device certificate.
    pub ca_cert: Option<PathBuf>,
    /// Manufacturer's signing certificate (`SIGCERT`).
    pub signer_cert: Option<PathBuf>,
    /// Trust chain for the manufacturer's certificate (`SIGCHAIN`).
    pub signer_chain: Option<PathBuf>,
    pub ocsp_url: String,
    /// Parent of the per-session scratch directories.
    pub scratch_root: PathBuf,
}

impl CaConfig {
    pub fn from_store(store: &ConfigStore) -> EnrollResult<Self> {
        let file_or = |key: &str, default: &str| match store.get(key) {
            "" => PathBuf::from(default),
            value => PathBuf::from(value),
        };
        let mut ocsp_url = store.get("OCSP").to_string();
        let ocsp_port = store.get("OCSPPORT");
        if !ocsp_port.is_empty() {
            ocsp_url = replace_url_port(&ocsp_url, ocsp_port);
        }
        let scratch_root = store.path_value("SCRATCH").unwrap_or_else(|| {
            store
                .path()
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default()
        });
        Ok(Self {
            ip: match store.get("IP") {
                "" => DEFAULT_CA_HOST.to_string(),
                ip => ip.to_string(),
            },
            port: store.port_value("PORT", DEFAULT_CA_PORT)?,
            csr_file: file_or("CSR", "tmpcsr.csr"),
            msg_file: file_or("MSG", "tmpmsg"),
            sig_file: file_or("SIG", "tmpsig"),
            cert_file: file_or("CERT", "tmpcert.pem"),
            ca_cert: store.path_value("CACERT"),
            signer_cert: store.path_value("SIGCERT"),
            signer_chain: store.path_value("SIGCHAIN"),
            ocsp_url,
            scratch_root,
        })
    }
}

/// Settings of the OCSP responder answering from the CA database.
#[derive(Debug, Clone)]
pub struct OcspResponderConfig {
    pub port: u16,
    /// The CA's certificate index (`CERTDB`).
    pub index: Option<PathBuf>,
    /// Responder signing certificate (`OCSPCERT`).
    pub signer_cert: Option<PathBuf>,
    /// Responder signing key (`OCSPSK`).
    pub signer_key: Option<PathBuf>,
    pub ca_cert: Option<PathBuf>,
    /// `openssl` executable, searched on `PATH` when `OPENSSL_PATH` is unset.
    pub openssl: PathBuf,
}

impl OcspResponderConfig {
    pub fn from_store(store: &ConfigStore) -> EnrollResult<Self> {
        let port = match store.get("OCSPPORT") {
            "" => return Err(EnrollError::config("OCSPPORT is not set")),
            _ => store.port_value("OCSPPORT", 0)?,
        };
        Ok(Self {
            port,
            index: store.path_value("CERTDB"),
            signer_cert: store.path_value("OCSPCERT"),
            signer_key: store.path_value("OCSPSK"),
            ca_cert: store.path_value("CACERT"),
            openssl: store
                .path_value("OPENSSL_PATH")
                .unwrap_or_else(|| PathBuf::from("openssl")),
        })
    }
}

/// Replace the port of an OCSP responder URL, appending one if the URL has none.
pub fn replace_url_port(url: &str, port: &str) -> String {
    if let Some(pos) = url.rfind(':') {
        let tail = &url[pos + 1..];
        if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) {
            return format!("{}{}", &url[..=pos], port);
        }
    }
    format!("{}:{}", url.trim_end_matches('/'), port)
}

/// Settings of an enrolling device, client or server role.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub subject: Subject,
    pub curve: String,
    pub ca_host: String,
    pub ca_port: u16,
    pub key_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    pub csr_path: Option<PathBuf>,
    pub msg_path: Option<PathBuf>,
    pub sig_path: Option<PathBuf>,
    pub ca_cert_path: Option<PathBuf>,
    pub ca_chain: Option<PathBuf>,
    pub server_host: String,
    pub server_port: u16,
    /// `client` or `server`.
    pub role: String,
    pub cert_reqs: String,
}

impl DeviceConfig {
    pub fn from_store(store: &ConfigStore) -> EnrollResult<Self> {
        let host_or = |key: &str, default: &str| match store.get(key) {
            "" => default.to_string(),
            value => value.to_string(),
        };
        Ok(Self {
            subject: Subject::from_store(store),
            curve: store.get("ECCPARAM").to_string(),
            ca_host: host_or("CAIP", DEFAULT_CA_HOST),
            ca_port: store.port_value("CAPORT", DEFAULT_CA_PORT)?,
            key_path: store.path_value("SK"),
            cert_path: store.path_value("CERT"),
            csr_path: store.path_value("CSR"),
            msg_path: store.path_value("MSG"),
            sig_path: store.path_value("SIG"),
            ca_cert_path: store.path_value("CACERT"),
            ca_chain: store.path_value("CACHAIN"),
            server_host: host_or("SERVERIP", DEFAULT_SERVER_HOST),
            server_port: store.port_value("SERVERPORT", DEFAULT_CA_PORT)?,
            role: store.get("TYPE").to_string(),
            cert_reqs: store.get("CERT_REQS").to_string(),
        })
    }

    /// Certificate manager view of the device identity.
    pub fn cert_config(&self) -> CertConfig {
        CertConfig {
            subject: self.subject.clone(),
            key_path: self.key_path.clone(),
            curve: self.curve.clone(),
            csr_path: self.csr_path.clone(),
            cert_path: self.cert_path.clone(),
            msg_path: self.msg_path.clone(),
            sig_path: self.sig_path.clone(),
            ca_chain: self.ca_chain.clone(),
            days: DEFAULT_ISSUE_DAYS,
            ..CertConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"# device configuration
CN = "sensor-01"
O = "Data61"
#OU = "disabled"
ECCPARAM = "prime256v1"
CAIP = "fd00::1"
CAPORT = "12345"
OCSP = "http://10.0.0.1:8888"
EMPTY =
CN = "sensor-02"
"#;

    #[test]
    fn test_parse_values() {
        let store = ConfigStore::from_text(SAMPLE);
        assert_eq!(store.get("O"), "Data61");
        assert_eq!(store.get("ECCPARAM"), "prime256v1");
        assert_eq!(store.get("OCSP"), "http://10.0.0.1:8888");
        // last occurrence wins
        assert_eq!(store.get("CN"), "sensor-02");
    }

    #[test]
    fn test_disabled_and_missing_keys_are_empty() {
        let store = ConfigStore::from_text(SAMPLE);
        assert_eq!(store.get("OU"), "");
        assert_eq!(store.get("EMPTY"), "");
        assert_eq!(store.get("NOT_THERE"), "");
        assert!(store.path_value("SK").is_none());
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let result = ConfigStore::load(dir.path().join("nope"));
        assert!(matches!(result, Err(EnrollError::Config(_))));
    }

    #[test]
    fn test_persist_rewrites_matching_lines_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clientcnf");
        fs::write(&path, SAMPLE).unwrap();

        let mut store = ConfigStore::load(&path).unwrap();
        let overrides = vec!["OU=Security".to_string(), "CAPORT=4433".to_string(), "SK=~/k.pem".to_string()];
        let changed = store.apply_overrides(&overrides, DEVICE_KEYS).unwrap();
        assert_eq!(changed, 3);
        store.persist().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("OU = \"Security\""));
        assert!(!text.contains("#OU"));
        assert!(text.contains("CAPORT = \"4433\""));
        assert!(text.contains("# device configuration"));
        assert!(text.contains("O = \"Data61\""));
        assert!(text.ends_with("SK = \"~/k.pem\"\n"));

        let reloaded = ConfigStore::load(&path).unwrap();
        assert_eq!(reloaded.get("OU"), "Security");
        assert_eq!(reloaded.get("CAPORT"), "4433");
    }

    #[test]
    fn test_unknown_override_key_rejected() {
        let mut store = ConfigStore::from_text(SAMPLE);
        let result = store.apply_overrides(&["BOGUS=1".to_string()], DEVICE_KEYS);
        assert!(matches!(result, Err(EnrollError::Config(_))));
    }

    #[test]
    fn test_cert_config_layout_defaults() {
        let store = ConfigStore::from_text(
            "CN = \"dev\"\nSELFSIGN = \"n\"\nWORKPATH = \"/srv/dev\"\nCAPATH = \"/srv/ca\"\nCERTS = \"/other/certs\"\n",
        );
        let config = CertConfig::from_store(&store).unwrap();
        assert_eq!(config.cert_path, Some(PathBuf::from("/srv/dev/dev.cert.pem")));
        assert_eq!(config.key_path, Some(PathBuf::from("/srv/dev/private/dev.key.pem")));
        assert_eq!(config.csr_path, Some(PathBuf::from("/srv/dev/dev.csr")));
        assert_eq!(config.cert_db, Some(PathBuf::from("/srv/ca/index.txt")));
        assert_eq!(config.certs_dir, Some(PathBuf::from("/other/certs")));
        assert_eq!(config.serial_file(), Some(PathBuf::from("/srv/ca/serial")));
        assert_eq!(config.days, 365);
    }

    #[test]
    fn test_self_signed_work_layout() {
        let store = ConfigStore::from_text("CN = \"ca\"\nSELFSIGN = \"Y\"\nWORKPATH = \"/srv/ca\"\n");
        let config = CertConfig::from_store(&store).unwrap();
        assert_eq!(config.cert_path, Some(PathBuf::from("/srv/ca/cacert.pem")));
        assert_eq!(config.key_path, Some(PathBuf::from("/srv/ca/private/cakey.pem")));
    }

    #[test]
    fn test_ocsp_responder_config() {
        let store = ConfigStore::from_text(
            "OCSPPORT = \"8888\"\nCERTDB = \"/ca/index.txt\"\nOCSPCERT = \"/ca/ocsp.pem\"\n",
        );
        let config = OcspResponderConfig::from_store(&store).unwrap();
        assert_eq!(config.port, 8888);
        assert_eq!(config.index, Some(PathBuf::from("/ca/index.txt")));
        assert_eq!(config.signer_cert, Some(PathBuf::from("/ca/ocsp.pem")));
        assert!(config.signer_key.is_none());
        assert_eq!(config.openssl, PathBuf::from("openssl"));

        let store = ConfigStore::from_text("CERTDB = \"/ca/index.txt\"\n");
        assert!(matches!(
            OcspResponderConfig::from_store(&store),
            Err(EnrollError::Config(_))
        ));
    }

    #[test]
    fn test_ca_config_ocsp_port_override() {
        let store = ConfigStore::from_text("OCSP = \"http://10.0.0.1:8888\"\nOCSPPORT = \"9999\"\n");
        let config = CaConfig::from_store(&store).unwrap();
        assert_eq!(config.ocsp_url, "http://10.0.0.1:9999");
        assert_eq!(config.port, DEFAULT_CA_PORT);
        assert_eq!(config.csr_file, PathBuf::from("tmpcsr.csr"));
        assert_eq!(replace_url_port("http://ocsp.local/", "81"), "http://ocsp.local:81");
    }

    #[test]
    fn test_invalid_port_is_config_error() {
        let store = ConfigStore::from_text("CAPORT = \"http\"\n");
        assert!(matches!(DeviceConfig::from_store(&store), Err(EnrollError::Config(_))));
    }
}
