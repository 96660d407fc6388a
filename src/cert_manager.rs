//! Certificate Manager Module
//!
//! Key, CSR and certificate lifecycle for one identity: EC key generation,
//! certificate signing requests, self-signed and CA-issued certificates,
//! detached signatures, key pairing checks and chain/revocation verification.
//!
//! # PKI Layout
//! ```text
//! CA certificate (self-signed, v3_ca, 10 years)
//!   └── Device certificate (CA-issued from the device CSR, DAYS validity)
//!
//! Manufacturer chain ── Manufacturer signer certificate
//!                         └── detached signature over the device's message file
//! ```
//!
//! Every operation reads its paths from the [`CertConfig`] the manager owns.

use crate::cert_db::{index_time, CertDatabase};
use crate::configs::{CertConfig, Subject};
use crate::error::{io_error, tool, EnrollError, EnrollResult, VerificationError};
use crate::ocsp;
use chrono::{Duration, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{Asn1Flag, EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::sign::{Signer, Verifier};
use openssl::stack::Stack;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectKeyIdentifier,
};
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509Builder, X509NameBuilder, X509NameRef, X509Ref, X509Req, X509StoreContext, X509};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const X509_REQ_VERSION_1: i32 = 0;
/// Validity of self-signed (root) certificates.
const SELF_SIGNED_VALIDITY_DAYS: u32 = 3650;

// ================= Signing Mode & Extension Profiles =================

/// How `create_certificate` produces its certificate, from the `SELFSIGN` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningMode {
    SelfSigned,
    CaIssued,
}

impl SigningMode {
    pub fn parse(flag: &str) -> EnrollResult<Self> {
        if flag.eq_ignore_ascii_case("y") {
            Ok(Self::SelfSigned)
        } else if flag.eq_ignore_ascii_case("n") {
            Ok(Self::CaIssued)
        } else {
            Err(EnrollError::config(format!(
                "SELFSIGN must be \"y\" or \"n\", got \"{}\"",
                flag
            )))
        }
    }
}

/// X.509v3 extension sets, named after the classic `openssl.cnf` sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtensionProfile {
    /// End-entity certificate for devices (default).
    #[default]
    UsrCert,
    /// TLS/DTLS server certificate.
    ServerCert,
    /// OCSP responder signing certificate.
    V3Ocsp,
    /// Certificate authority.
    V3Ca,
}

impl FromStr for ExtensionProfile {
    type Err = EnrollError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "usr_cert" => Ok(Self::UsrCert),
            "server_cert" => Ok(Self::ServerCert),
            "v3_ocsp" => Ok(Self::V3Ocsp),
            "v3_ca" => Ok(Self::V3Ca),
            other => Err(EnrollError::config(format!(
                "unknown certificate extension profile \"{}\"",
                other
            ))),
        }
    }
}

impl ExtensionProfile {
    /// Append this profile's extensions to a certificate under construction.
    ///
    /// # Arguments
    /// * `builder` - Certificate builder with subject and public key already set
    /// * `issuer` - Issuing certificate, or `None` when self-signing
    fn apply(self, builder: &mut X509Builder, issuer: Option<&X509Ref>) -> EnrollResult<()> {
        let mut basic = BasicConstraints::new();
        let mut usage = KeyUsage::new();
        let mut extended = None;
        match self {
            Self::UsrCert => {
                usage.digital_signature().non_repudiation().key_encipherment();
            }
            Self::ServerCert => {
                usage.digital_signature().key_encipherment();
                extended = Some(ExtendedKeyUsage::new().server_auth().build());
            }
            Self::V3Ocsp => {
                usage.non_repudiation().digital_signature().key_encipherment();
                extended = Some(ExtendedKeyUsage::new().other("OCSPSigning").build());
            }
            Self::V3Ca => {
                basic.critical().ca();
                usage.critical().key_cert_sign().crl_sign();
            }
        }

        let extension = basic.build().map_err(tool("Failed to build BasicConstraints"))?;
        builder
            .append_extension(extension)
            .map_err(tool("Failed to add BasicConstraints"))?;

        let extension = usage.build().map_err(tool("Failed to build KeyUsage"))?;
        builder
            .append_extension(extension)
            .map_err(tool("Failed to add KeyUsage"))?;

        if let Some(extension) = extended {
            let extension = extension.map_err(tool("Failed to build ExtendedKeyUsage"))?;
            builder
                .append_extension(extension)
                .map_err(tool("Failed to add ExtendedKeyUsage"))?;
        }

        let extension = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(issuer, None))
            .map_err(tool("Failed to build SubjectKeyIdentifier"))?;
        builder
            .append_extension(extension)
            .map_err(tool("Failed to add SubjectKeyIdentifier"))?;

        let extension = AuthorityKeyIdentifier::new()
            .keyid(false)
            .issuer(false)
            .build(&builder.x509v3_context(issuer, None))
            .map_err(tool("Failed to build AuthorityKeyIdentifier"))?;
        builder
            .append_extension(extension)
            .map_err(tool("Failed to add AuthorityKeyIdentifier"))?;

        Ok(())
    }
}

// ================= Certificate Manager =================

/// Certificate lifecycle operations for one identity.
///
/// # Examples
/// ```rust,no_run
/// use iot_enroll::cert_manager::CertManager;
/// use iot_enroll::configs::{CertConfig, ConfigStore};
/// # fn example() -> iot_enroll::error::EnrollResult<()> {
/// let store = ConfigStore::load("certcnf")?;
/// let manager = CertManager::new(CertConfig::from_store(&store)?);
/// manager.create_csr()?; // creates the key first when missing
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CertManager {
    config: CertConfig,
}

impl CertManager {
    pub fn new(config: CertConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CertConfig {
        &self.config
    }

    /// Generate a new EC private key on the configured curve.
    ///
    /// Overwrites an existing key at the same path.
    ///
    /// # Returns
    /// Path of the written key.
    ///
    /// # Errors
    /// `Config` if the key path or curve is unset or the curve is unknown;
    /// `Tool` if key generation fails.
    pub fn create_key(&self) -> EnrollResult<PathBuf> {
        let key_path = required(&self.config.key_path, "private key path (SK)")?;
        if self.config.curve.is_empty() {
            return Err(EnrollError::config("ECC parameter (ECCPARAM) is empty"));
        }
        let nid = curve_nid(&self.config.curve)?;

        let mut group = EcGroup::from_curve_name(nid).map_err(tool("Failed to load EC group"))?;
        group.set_asn1_flag(Asn1Flag::NAMED_CURVE);
        let ec_key = EcKey::generate(&group).map_err(tool("Failed to generate EC keypair"))?;
        let pem = ec_key
            .private_key_to_pem()
            .map_err(tool("Failed to encode private key"))?;

        write_file(key_path, &pem)?;
        info!(path = %key_path.display(), curve = %self.config.curve, "private key created");
        Ok(key_path.to_path_buf())
    }

    /// Write a CSR for the configured subject, creating the key if missing.
    ///
    /// Empty subject fields are left out of the request.
    pub fn create_csr(&self) -> EnrollResult<PathBuf> {
        let csr_path = required(&self.config.csr_path, "certificate signing request path (CSR)")?;
        let key_path = required(&self.config.key_path, "private key path (SK)")?;
        if !key_path.exists() {
            self.create_key()?;
        }
        let key = load_private_key(key_path)?;
        let name = build_name(&self.config.subject)?;

        let mut builder = X509Req::builder().map_err(tool("Failed to create CSR builder"))?;
        builder
            .set_version(X509_REQ_VERSION_1)
            .map_err(tool("Failed to set CSR version"))?;
        builder
            .set_subject_name(&name)
            .map_err(tool("Failed to set CSR subject"))?;
        builder
            .set_pubkey(&key)
            .map_err(tool("Failed to set CSR public key"))?;
        builder
            .sign(&key, MessageDigest::sha256())
            .map_err(tool("Failed to sign CSR"))?;
        let pem = builder.build().to_pem().map_err(tool("Failed to encode CSR"))?;

        write_file(csr_path, &pem)?;
        info!(path = %csr_path.display(), "certificate signing request created");
        Ok(csr_path.to_path_buf())
    }

    /// Produce the identity's certificate.
    ///
    /// In self-signed mode the key and CSR are created as needed and the
    /// certificate is signed by its own key with a 10 year validity. In CA
    /// mode an existing certificate for the CSR subject is copied from the
    /// database; otherwise the CSR is signed by the CA key.
    ///
    /// # Returns
    /// Path of the written certificate.
    pub fn create_certificate(&self) -> EnrollResult<PathBuf> {
        let csr_path = required(&self.config.csr_path, "certificate signing request path (CSR)")?;
        let mode = SigningMode::parse(&self.config.self_sign)?;
        let cert_path = required(&self.config.cert_path, "output certificate path (CERT)")?;

        match mode {
            SigningMode::SelfSigned => {
                let key_path = required(&self.config.key_path, "private key path (SK)")?;
                if !key_path.exists() {
                    self.create_key()?;
                }
                self.create_csr()?;
                let cert = self.self_sign(csr_path, key_path)?;
                let pem = cert.to_pem().map_err(tool("Failed to encode certificate"))?;
                write_file(cert_path, &pem)?;
                info!(path = %cert_path.display(), "self-signed certificate created");
            }
            SigningMode::CaIssued => {
                let db = self.open_database()?;
                let subject = csr_subject(csr_path)?;
                let tx = db.transaction()?;
                if let Some(existing) = tx.find(&subject)? {
                    ensure_parent(cert_path)?;
                    fs::copy(&existing, cert_path)
                        .map_err(io_error(format!("Failed to copy {}", existing.display())))?;
                    info!(subject = %subject, path = %existing.display(), "reusing certificate already issued");
                    return Ok(cert_path.to_path_buf());
                }

                let serial = tx.next_serial()?;
                let expires = Utc::now() + Duration::days(i64::from(self.config.days));
                let cert = self.issue(csr_path, &serial, expires.timestamp())?;
                let pem = cert.to_pem().map_err(tool("Failed to encode certificate"))?;
                let stored = tx.record(&serial, &pem, &subject, &index_time(expires))?;
                write_file(cert_path, &pem)?;
                info!(subject = %subject, path = %stored.display(), "certificate issued");
            }
        }
        Ok(cert_path.to_path_buf())
    }

    /// Resolve the database certificate issued for the configured CSR's subject.
    ///
    /// # Returns
    /// `Ok(None)` when the subject has never been issued a certificate.
    ///
    /// # Errors
    /// `NotFound` if the database or storage paths are invalid, or the index
    /// entry has no certificate file.
    pub fn find_certificate(&self) -> EnrollResult<Option<PathBuf>> {
        let csr_path = required(&self.config.csr_path, "certificate signing request path (CSR)")?;
        if !csr_path.is_file() {
            return Err(EnrollError::NotFound(format!(
                "certificate signing request \"{}\" is not a file",
                csr_path.display()
            )));
        }
        let subject = csr_subject(csr_path)?;
        self.open_database()?.find(&subject)
    }

    /// Check that the certificate's public key belongs to the private key.
    pub fn verify_key_pair(&self) -> EnrollResult<()> {
        let cert_path = existing_file(&self.config.cert_path, "certificate (CERT)")?;
        let key_path = existing_file(&self.config.key_path, "private key (SK)")?;

        let cert = load_certificate(cert_path)?;
        let key = load_private_key(key_path)?;
        let cert_public = cert
            .public_key()
            .and_then(|k| k.public_key_to_der())
            .map_err(|e| invalid_certificate(cert_path, e))?;
        let key_public = key
            .public_key_to_der()
            .map_err(tool("Failed to extract public key from private key"))?;

        if cert_public != key_public {
            return Err(VerificationError::KeyMismatch(format!(
                "{} was not issued for {}",
                cert_path.display(),
                key_path.display()
            ))
            .into());
        }
        info!("certificate and private key pair is valid");
        Ok(())
    }

    /// Write a detached SHA-256 signature over the message file.
    pub fn sign_message(&self) -> EnrollResult<PathBuf> {
        let msg_path = required(&self.config.msg_path, "message file path (MSG)")?;
        let sig_path = required(&self.config.sig_path, "signature file path (SIG)")?;
        let key_path = existing_file(&self.config.key_path, "private key (SK)")?;

        let key = load_private_key(key_path)?;
        let message = read_file(msg_path)?;
        let mut signer =
            Signer::new(MessageDigest::sha256(), &key).map_err(tool("Failed to create signer"))?;
        signer.update(&message).map_err(tool("Failed to hash message"))?;
        let signature = signer.sign_to_vec().map_err(tool("Failed to sign message"))?;

        write_file(sig_path, &signature)?;
        info!(path = %sig_path.display(), "message signed");
        Ok(sig_path.to_path_buf())
    }

    /// Verify the detached signature over the message with the signer's certificate.
    ///
    /// # Errors
    /// `Verification(InvalidCertificate)` if the signer certificate cannot be
    /// used; `Verification(SignatureMismatch)` if the signature does not match.
    pub fn verify_signature(&self) -> EnrollResult<()> {
        let msg_path = existing_file(&self.config.msg_path, "message file (MSG)")?;
        let sig_path = existing_file(&self.config.sig_path, "signature file (SIG)")?;
        let cert_path = existing_file(&self.config.signer_cert, "signer's certificate (SIGCERT)")?;

        let cert = load_certificate(cert_path)?;
        let public_key = cert
            .public_key()
            .map_err(|e| invalid_certificate(cert_path, e))?;
        let message = read_file(msg_path)?;
        let signature = read_file(sig_path)?;

        let mut verifier = Verifier::new(MessageDigest::sha256(), &public_key)
            .map_err(|e| invalid_certificate(cert_path, e))?;
        verifier.update(&message).map_err(tool("Failed to hash message"))?;
        match verifier.verify(&signature) {
            Ok(true) => {
                info!("signature is valid");
                Ok(())
            }
            Ok(false) | Err(_) => Err(VerificationError::SignatureMismatch(format!(
                "{} is not a signature over {} by {}",
                sig_path.display(),
                msg_path.display(),
                cert_path.display()
            ))
            .into()),
        }
    }

    /// Validate `cert` against the trust anchors in `chain`.
    ///
    /// With a non-empty `ocsp_url` the revocation status is queried first and
    /// the check fails closed on a revoked certificate.
    ///
    /// # Errors
    /// `Revoked`, `Ocsp` for responder failures, `ChainInvalid` when the chain
    /// does not authenticate the certificate.
    pub fn verify_certificate_chain(&self, chain: &Path, cert: &Path, ocsp_url: &str) -> EnrollResult<()> {
        if !cert.is_file() {
            return Err(EnrollError::config(format!(
                "path \"{}\" to the certificate is invalid or it is not a file",
                cert.display()
            )));
        }
        if !chain.is_file() {
            return Err(EnrollError::config(format!(
                "path \"{}\" to the CA certificate chain is invalid or it is not a file",
                chain.display()
            )));
        }
        let certificate = load_certificate(cert)?;
        let anchors = X509::stack_from_pem(&read_file(chain)?)
            .map_err(|e| EnrollError::ChainInvalid(format!("{}: {}", chain.display(), e)))?;
        if anchors.is_empty() {
            return Err(EnrollError::ChainInvalid(format!(
                "{} holds no certificates",
                chain.display()
            )));
        }

        if !ocsp_url.is_empty() {
            let status = ocsp::check_revocation(&certificate, &anchors, ocsp_url)?;
            debug!(?status, url = ocsp_url, "revocation status checked");
        }

        let mut store = X509StoreBuilder::new().map_err(tool("Failed to create trust store"))?;
        for anchor in anchors {
            store
                .add_cert(anchor)
                .map_err(tool("Failed to add certificate to trust store"))?;
        }
        let store = store.build();
        let untrusted = Stack::new().map_err(tool("Failed to create certificate stack"))?;
        let mut context = X509StoreContext::new().map_err(tool("Failed to create verify context"))?;
        let (verified, result) = context
            .init(&store, &certificate, &untrusted, |ctx| {
                let verified = ctx.verify_cert()?;
                Ok((verified, ctx.error()))
            })
            .map_err(tool("Failed to run certificate verification"))?;

        if !verified {
            return Err(EnrollError::ChainInvalid(format!(
                "{}: {}",
                cert.display(),
                result.error_string()
            )));
        }
        info!(cert = %cert.display(), "certificate verified");
        Ok(())
    }

    fn open_database(&self) -> EnrollResult<CertDatabase> {
        let index = self
            .config
            .cert_db
            .as_deref()
            .ok_or_else(|| EnrollError::NotFound("certificate database path (CERTDB) is empty".into()))?;
        let certs = self
            .config
            .certs_dir
            .as_deref()
            .ok_or_else(|| EnrollError::NotFound("certificate storage path (CERTS) is empty".into()))?;
        let serial = self.config.serial_file().unwrap_or_else(|| PathBuf::from("serial"));
        CertDatabase::open(index, certs, &serial)
    }

    fn self_sign(&self, csr_path: &Path, key_path: &Path) -> EnrollResult<X509> {
        let request = load_request(csr_path)?;
        let key = load_private_key(key_path)?;

        let mut builder = X509::builder().map_err(tool("Failed to create X509 builder"))?;
        builder
            .set_version(X509_VERSION_3)
            .map_err(tool("Failed to set version"))?;

        // Generate random 128-bit (16-byte) serial number
        let mut serial = BigNum::new().map_err(tool("Failed to allocate serial"))?;
        serial
            .rand(128, MsbOption::MAYBE_ZERO, false)
            .map_err(tool("Failed to generate serial"))?;
        let serial = serial.to_asn1_integer().map_err(tool("Failed to encode serial"))?;
        builder
            .set_serial_number(&serial)
            .map_err(tool("Failed to set serial"))?;

        builder
            .set_subject_name(request.subject_name())
            .map_err(tool("Failed to set subject"))?;
        builder
            .set_issuer_name(request.subject_name())
            .map_err(tool("Failed to set issuer"))?;
        set_validity(&mut builder, Asn1Time::days_from_now(SELF_SIGNED_VALIDITY_DAYS))?;
        builder
            .set_pubkey(&key)
            .map_err(tool("Failed to set public key"))?;
        ExtensionProfile::V3Ca.apply(&mut builder, None)?;
        builder
            .sign(&key, MessageDigest::sha256())
            .map_err(tool("Failed to sign certificate"))?;
        Ok(builder.build())
    }

    fn issue(&self, csr_path: &Path, serial: &BigNum, not_after_unix: i64) -> EnrollResult<X509> {
        let profile: ExtensionProfile = self.config.extensions.parse()?;
        let ca_key_path = existing_file(&self.config.ca_key, "CA private key (CAKEY)")?;
        let ca_cert_path = existing_file(&self.config.ca_cert, "CA certificate (CACERT)")?;
        let ca_key = load_private_key(ca_key_path)?;
        let ca_cert = load_certificate(ca_cert_path)?;

        let request = load_request(csr_path)?;
        let request_key = request
            .public_key()
            .map_err(tool("Failed to extract public key from CSR"))?;
        if !request.verify(&request_key).map_err(tool("Failed to verify CSR"))? {
            return Err(VerificationError::SignatureMismatch(format!(
                "signature on {} does not match its public key",
                csr_path.display()
            ))
            .into());
        }

        let mut builder = X509::builder().map_err(tool("Failed to create X509 builder"))?;
        builder
            .set_version(X509_VERSION_3)
            .map_err(tool("Failed to set version"))?;
        let serial = serial.to_asn1_integer().map_err(tool("Failed to encode serial"))?;
        builder
            .set_serial_number(&serial)
            .map_err(tool("Failed to set serial"))?;
        builder
            .set_subject_name(request.subject_name())
            .map_err(tool("Failed to set subject"))?;
        builder
            .set_issuer_name(ca_cert.subject_name())
            .map_err(tool("Failed to set issuer from CA certificate"))?;
        set_validity(&mut builder, Asn1Time::from_unix(not_after_unix))?;
        builder
            .set_pubkey(&request_key)
            .map_err(tool("Failed to set public key"))?;
        profile.apply(&mut builder, Some(&ca_cert))?;
        builder
            .sign(&ca_key, MessageDigest::sha256())
            .map_err(tool("Failed to sign certificate"))?;
        Ok(builder.build())
    }
}

// ================= Helpers =================

fn set_validity(
    builder: &mut X509Builder,
    not_after: Result<Asn1Time, openssl::error::ErrorStack>,
) -> EnrollResult<()> {
    let not_before = Asn1Time::days_from_now(0).map_err(tool("Failed to create not_before"))?;
    builder
        .set_not_before(&not_before)
        .map_err(tool("Failed to set not_before"))?;
    let not_after = not_after.map_err(tool("Failed to create not_after"))?;
    builder
        .set_not_after(&not_after)
        .map_err(tool("Failed to set not_after"))
}

/// Map a curve name to its OpenSSL identifier.
pub fn curve_nid(name: &str) -> EnrollResult<Nid> {
    match name {
        "prime256v1" | "secp256r1" | "P-256" => Ok(Nid::X9_62_PRIME256V1),
        "secp384r1" | "P-384" => Ok(Nid::SECP384R1),
        "secp521r1" | "P-521" => Ok(Nid::SECP521R1),
        "secp256k1" => Ok(Nid::SECP256K1),
        "secp224r1" | "P-224" => Ok(Nid::SECP224R1),
        "prime192v1" | "P-192" => Ok(Nid::X9_62_PRIME192V1),
        other => Err(EnrollError::config(format!("unsupported ECC parameter \"{}\"", other))),
    }
}

fn build_name(subject: &Subject) -> EnrollResult<openssl::x509::X509Name> {
    let mut builder = X509NameBuilder::new().map_err(tool("Failed to create name builder"))?;
    let fields = [
        (Nid::COUNTRYNAME, &subject.country),
        (Nid::STATEORPROVINCENAME, &subject.state),
        (Nid::LOCALITYNAME, &subject.locality),
        (Nid::ORGANIZATIONNAME, &subject.organization),
        (Nid::ORGANIZATIONALUNITNAME, &subject.organizational_unit),
        (Nid::COMMONNAME, &subject.common_name),
        (Nid::PKCS9_EMAILADDRESS, &subject.email),
    ];
    for (nid, value) in fields {
        if value.is_empty() {
            continue;
        }
        builder
            .append_entry_by_nid(nid, value)
            .map_err(tool(format!("Failed to set subject field {}", nid.short_name().unwrap_or("?"))))?;
    }
    Ok(builder.build())
}

/// One-line `/C=../CN=..` rendering of a name, as stored in the CA index.
pub fn subject_line(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let key = entry.object().nid().short_name().unwrap_or("UNDEF");
            let value = entry.data().to_string().unwrap_or_default();
            format!("/{}={}", key, value)
        })
        .collect()
}

/// Subject line of the CSR at `path`.
pub fn csr_subject(path: &Path) -> EnrollResult<String> {
    Ok(subject_line(load_request(path)?.subject_name()))
}

fn load_request(path: &Path) -> EnrollResult<X509Req> {
    X509Req::from_pem(&read_file(path)?)
        .map_err(tool(format!("Can't read certificate signing request {}", path.display())))
}

fn load_private_key(path: &Path) -> EnrollResult<PKey<Private>> {
    PKey::private_key_from_pem(&read_file(path)?)
        .map_err(tool(format!("Can't read private key {}", path.display())))
}

fn load_certificate(path: &Path) -> EnrollResult<X509> {
    X509::from_pem(&read_file(path)?).map_err(|e| invalid_certificate(path, e))
}

fn invalid_certificate(path: &Path, err: openssl::error::ErrorStack) -> EnrollError {
    VerificationError::InvalidCertificate {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
    .into()
}

fn required<'a>(path: &'a Option<PathBuf>, what: &str) -> EnrollResult<&'a Path> {
    path.as_deref()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| EnrollError::config(format!("{} is empty", what)))
}

fn existing_file<'a>(path: &'a Option<PathBuf>, what: &str) -> EnrollResult<&'a Path> {
    let path = required(path, what)?;
    if !path.is_file() {
        return Err(EnrollError::config(format!(
            "{} \"{}\" is not a file",
            what,
            path.display()
        )));
    }
    Ok(path)
}

fn read_file(path: &Path) -> EnrollResult<Vec<u8>> {
    fs::read(path).map_err(io_error(format!("Failed to read {}", path.display())))
}

fn ensure_parent(path: &Path) -> EnrollResult<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)
            .map_err(io_error(format!("Failed to create directory {}", parent.display()))),
        _ => Ok(()),
    }
}

fn write_file(path: &Path, data: &[u8]) -> EnrollResult<()> {
    ensure_parent(path)?;
    fs::write(path, data).map_err(io_error(format!("Failed to write {}", path.display())))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// A throwaway self-signed P-256 certificate and its key.
    pub(crate) fn self_signed_pair(cn: &str) -> (PKey<Private>, X509) {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
        let name = name.build();
        let mut builder = X509::builder().unwrap();
        builder.set_version(X509_VERSION_3).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        set_validity(&mut builder, Asn1Time::days_from_now(1)).unwrap();
        builder.set_pubkey(&key).unwrap();
        ExtensionProfile::V3Ca.apply(&mut builder, None).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        (key, builder.build())
    }

    fn subject(cn: &str) -> Subject {
        Subject {
            country: "AU".into(),
            state: "NSW".into(),
            locality: "Sydney".into(),
            organization: "Data61".into(),
            organizational_unit: "".into(),
            common_name: cn.into(),
            email: format!("{}@example.com", cn),
        }
    }

    /// A CA identity rooted at `dir/ca` with an initialised database.
    fn ca_config(dir: &Path) -> CertConfig {
        let mut config = CertConfig {
            subject: subject("Test CA"),
            curve: "prime256v1".into(),
            self_sign: "y".into(),
            days: 365,
            ..CertConfig::default()
        };
        config.apply_ca_layout(&dir.join("ca"));
        config.key_path = config.ca_key.clone();
        config.cert_path = config.ca_cert.clone();
        config.csr_path = Some(dir.join("ca").join("ca.csr"));
        CertDatabase::init(
            config.cert_db.as_deref().unwrap(),
            config.certs_dir.as_deref().unwrap(),
            &config.serial_file().unwrap(),
        )
        .unwrap();
        config
    }

    fn device_config(dir: &Path, cn: &str) -> CertConfig {
        let mut config = CertConfig {
            subject: subject(cn),
            curve: "prime256v1".into(),
            self_sign: "n".into(),
            days: 365,
            ..CertConfig::default()
        };
        config.apply_work_layout(&dir.join(cn));
        config
    }

    #[test]
    fn test_create_key_requires_config() {
        let manager = CertManager::new(CertConfig::default());
        assert!(matches!(manager.create_key(), Err(EnrollError::Config(_))));

        let dir = TempDir::new().unwrap();
        let manager = CertManager::new(CertConfig {
            key_path: Some(dir.path().join("k.pem")),
            ..CertConfig::default()
        });
        assert!(matches!(manager.create_key(), Err(EnrollError::Config(_))));

        let manager = CertManager::new(CertConfig {
            key_path: Some(dir.path().join("k.pem")),
            curve: "brainpool-unknown".into(),
            ..CertConfig::default()
        });
        assert!(matches!(manager.create_key(), Err(EnrollError::Config(_))));
    }

    #[test]
    fn test_create_csr_creates_missing_key() {
        let dir = TempDir::new().unwrap();
        let config = device_config(dir.path(), "sensor-01");
        let manager = CertManager::new(config.clone());

        let csr = manager.create_csr().unwrap();
        assert!(config.key_path.as_ref().unwrap().is_file());
        assert_eq!(
            csr_subject(&csr).unwrap(),
            "/C=AU/ST=NSW/L=Sydney/O=Data61/CN=sensor-01/emailAddress=sensor-01@example.com"
        );
    }

    #[test]
    fn test_create_csr_requires_output_path() {
        let manager = CertManager::new(CertConfig {
            key_path: Some(PathBuf::from("k.pem")),
            ..CertConfig::default()
        });
        assert!(matches!(manager.create_csr(), Err(EnrollError::Config(_))));
    }

    #[test]
    fn test_self_signed_certificate_verifies_against_itself() {
        let dir = TempDir::new().unwrap();
        let config = ca_config(dir.path());
        let manager = CertManager::new(config.clone());

        let cert_path = manager.create_certificate().unwrap();
        manager.verify_key_pair().unwrap();
        manager
            .verify_certificate_chain(&cert_path, &cert_path, "")
            .unwrap();

        let cert = load_certificate(&cert_path).unwrap();
        assert_eq!(cert.subject_name().to_der().unwrap(), cert.issuer_name().to_der().unwrap());
    }

    #[test]
    fn test_invalid_self_sign_flag() {
        let dir = TempDir::new().unwrap();
        let mut config = device_config(dir.path(), "sensor-01");
        config.self_sign = "maybe".into();
        let result = CertManager::new(config).create_certificate();
        assert!(matches!(result, Err(EnrollError::Config(_))));
    }

    #[test]
    fn test_ca_issuance_is_idempotent_per_subject() {
        let dir = TempDir::new().unwrap();
        let ca = ca_config(dir.path());
        CertManager::new(ca.clone()).create_certificate().unwrap();

        let device = device_config(dir.path(), "sensor-01");
        let device_manager = CertManager::new(device.clone());
        device_manager.create_csr().unwrap();

        let mut issuing = ca.clone();
        issuing.self_sign = "n".into();
        issuing.csr_path = device.csr_path.clone();
        issuing.cert_path = Some(dir.path().join("issued-1.pem"));
        let first = CertManager::new(issuing.clone()).create_certificate().unwrap();

        issuing.cert_path = Some(dir.path().join("issued-2.pem"));
        let second = CertManager::new(issuing.clone()).create_certificate().unwrap();

        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
        let db_copy = CertManager::new(issuing).find_certificate().unwrap().unwrap();
        assert_eq!(fs::read(&db_copy).unwrap(), fs::read(&first).unwrap());

        // the issued certificate chains to the CA and pairs with the device key
        let ca_cert = ca.cert_path.clone().unwrap();
        device_manager
            .verify_certificate_chain(&ca_cert, &first, "")
            .unwrap();
        let mut paired = device.clone();
        paired.cert_path = Some(first);
        CertManager::new(paired).verify_key_pair().unwrap();
    }

    #[test]
    fn test_find_certificate_without_database_is_not_found() {
        let dir = TempDir::new().unwrap();
        let device = device_config(dir.path(), "sensor-01");
        let manager = CertManager::new(device);
        manager.create_csr().unwrap();
        assert!(matches!(manager.find_certificate(), Err(EnrollError::NotFound(_))));
    }

    #[test]
    fn test_key_pair_mismatch() {
        let dir = TempDir::new().unwrap();
        let (_, cert) = self_signed_pair("someone-else");
        let cert_path = dir.path().join("other.pem");
        fs::write(&cert_path, cert.to_pem().unwrap()).unwrap();

        let mut config = device_config(dir.path(), "sensor-01");
        CertManager::new(config.clone()).create_key().unwrap();
        config.cert_path = Some(cert_path);
        let result = CertManager::new(config).verify_key_pair();
        assert!(matches!(
            result,
            Err(EnrollError::Verification(VerificationError::KeyMismatch(_)))
        ));
    }

    #[test]
    fn test_sign_and_verify_message() {
        let dir = TempDir::new().unwrap();
        let (key, cert) = self_signed_pair("manufacturer");
        let key_path = dir.path().join("mkey.pem");
        let cert_path = dir.path().join("mcert.pem");
        fs::write(&key_path, key.private_key_to_pem_pkcs8().unwrap()).unwrap();
        fs::write(&cert_path, cert.to_pem().unwrap()).unwrap();
        let msg_path = dir.path().join("msg");
        fs::write(&msg_path, b"device sensor-01 built 2018-02-01").unwrap();

        let config = CertConfig {
            key_path: Some(key_path),
            msg_path: Some(msg_path.clone()),
            sig_path: Some(dir.path().join("sig")),
            signer_cert: Some(cert_path),
            ..CertConfig::default()
        };
        let manager = CertManager::new(config.clone());
        let sig_path = manager.sign_message().unwrap();
        manager.verify_signature().unwrap();

        // flipping one byte of the signature breaks it
        let mut signature = fs::read(&sig_path).unwrap();
        let last = signature.len() - 1;
        signature[last] ^= 0x01;
        fs::write(&sig_path, &signature).unwrap();
        assert!(matches!(
            manager.verify_signature(),
            Err(EnrollError::Verification(VerificationError::SignatureMismatch(_)))
        ));

        // so does flipping one byte of the message
        manager.sign_message().unwrap();
        let mut message = fs::read(&msg_path).unwrap();
        message[0] ^= 0x01;
        fs::write(&msg_path, &message).unwrap();
        assert!(matches!(
            manager.verify_signature(),
            Err(EnrollError::Verification(VerificationError::SignatureMismatch(_)))
        ));
    }

    #[test]
    fn test_verify_signature_invalid_certificate() {
        let dir = TempDir::new().unwrap();
        let bogus = dir.path().join("bogus.pem");
        fs::write(&bogus, b"-----BEGIN CERTIFICATE-----\nnope\n-----END CERTIFICATE-----\n").unwrap();
        fs::write(dir.path().join("msg"), b"m").unwrap();
        fs::write(dir.path().join("sig"), b"s").unwrap();
        let manager = CertManager::new(CertConfig {
            msg_path: Some(dir.path().join("msg")),
            sig_path: Some(dir.path().join("sig")),
            signer_cert: Some(bogus),
            ..CertConfig::default()
        });
        assert!(matches!(
            manager.verify_signature(),
            Err(EnrollError::Verification(VerificationError::InvalidCertificate { .. }))
        ));
    }

    #[test]
    fn test_chain_rejects_foreign_certificate() {
        let dir = TempDir::new().unwrap();
        let (_, anchor) = self_signed_pair("anchor");
        let (_, stranger) = self_signed_pair("stranger");
        let chain = dir.path().join("chain.pem");
        let cert = dir.path().join("cert.pem");
        fs::write(&chain, anchor.to_pem().unwrap()).unwrap();
        fs::write(&cert, stranger.to_pem().unwrap()).unwrap();

        let result = CertManager::new(CertConfig::default()).verify_certificate_chain(&chain, &cert, "");
        assert!(matches!(result, Err(EnrollError::ChainInvalid(_))));
    }

    #[test]
    fn test_subject_line_keeps_interior_nul() {
        let line = |cn: &str| {
            let mut name = X509NameBuilder::new().unwrap();
            name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "Data61").unwrap();
            name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
            subject_line(&name.build())
        };
        assert_eq!(line("sensor-01"), "/O=Data61/CN=sensor-01");
        assert_eq!(line("sensor\0-01"), "/O=Data61/CN=sensor\0-01");
        assert_ne!(line("sensor\0-01"), line("sensor\0-02"));
    }

    #[test]
    fn test_extension_profile_names() {
        assert_eq!("".parse::<ExtensionProfile>().unwrap(), ExtensionProfile::UsrCert);
        assert_eq!("v3_ocsp".parse::<ExtensionProfile>().unwrap(), ExtensionProfile::V3Ocsp);
        assert!("v3_bogus".parse::<ExtensionProfile>().is_err());
        assert_eq!(curve_nid("P-384").unwrap(), Nid::SECP384R1);
    }
}
