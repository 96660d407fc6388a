//! OCSP Module
//!
//! Revocation status queries against an OCSP responder over HTTP, and the
//! launcher for the responder that answers from the CA database.

use crate::configs::OcspResponderConfig;
use crate::error::{io_error, tool, EnrollError, EnrollResult};
use openssl::hash::MessageDigest;
use openssl::ocsp::{
    OcspBasicResponseRef, OcspCertId, OcspCertIdRef, OcspCertStatus, OcspFlag, OcspRequest,
    OcspResponse, OcspResponseStatus,
};
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509Ref, X509VerifyResult, X509};
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

const OCSP_TIMEOUT: Duration = Duration::from_secs(30);
/// Tolerated clock skew when checking response freshness, in seconds.
const VALIDITY_LEEWAY_SECS: u32 = 300;

/// Outcome of a revocation check that did not fail closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationStatus {
    Good,
    /// The responder does not know the certificate.
    Unknown,
}

/// Find the certificate in `chain` that issued `cert`.
pub fn find_issuer<'a>(cert: &X509Ref, chain: &'a [X509]) -> Option<&'a X509> {
    chain
        .iter()
        .find(|candidate| candidate.issued(cert) == X509VerifyResult::OK)
}

fn cert_id(cert: &X509Ref, issuer: &X509Ref) -> EnrollResult<OcspCertId> {
    OcspCertId::from_cert(MessageDigest::sha1(), cert, issuer)
        .map_err(tool("Failed to build OCSP certificate id"))
}

/// DER-encoded OCSP request for `cert` issued by `issuer`.
///
/// The request carries no nonce; the openssl bindings do not expose nonce
/// handling, so replay is bounded by the response freshness check instead.
pub fn request_der(cert: &X509Ref, issuer: &X509Ref) -> EnrollResult<Vec<u8>> {
    let mut request = OcspRequest::new().map_err(tool("Failed to create OCSP request"))?;
    request
        .add_id(cert_id(cert, issuer)?)
        .map_err(tool("Failed to add certificate to OCSP request"))?;
    request.to_der().map_err(tool("Failed to encode OCSP request"))
}

/// Query `url` for the revocation status of `cert`.
///
/// The response must be signed by a responder that `chain` authenticates.
///
/// # Errors
/// * `Revoked` - the responder reports the certificate as revoked
/// * `Ocsp` - transport failure, unsuccessful, unparsable or unauthenticated
///   response, or no status for the certificate
pub fn check_revocation(cert: &X509Ref, chain: &[X509], url: &str) -> EnrollResult<RevocationStatus> {
    let issuer = find_issuer(cert, chain)
        .ok_or_else(|| EnrollError::Ocsp("issuer certificate not found in chain".to_string()))?;

    let request = request_der(cert, issuer)?;
    debug!(url, bytes = request.len(), "querying OCSP responder");
    let response_der = post_request(url, &request)?;
    let id = cert_id(cert, issuer)?;
    classify_response(&response_der, &id, chain)
}

fn post_request(url: &str, body: &[u8]) -> EnrollResult<Vec<u8>> {
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(OCSP_TIMEOUT))
        .build();
    let agent = ureq::Agent::new_with_config(config);
    let mut response = agent
        .post(url)
        .content_type("application/ocsp-request")
        .send(body)
        .map_err(|e| EnrollError::Ocsp(format!("request to {} failed: {}", url, e)))?;
    response
        .body_mut()
        .read_to_vec()
        .map_err(|e| EnrollError::Ocsp(format!("failed to read response from {}: {}", url, e)))
}

/// Classify a DER-encoded OCSP response for the certificate `id`.
///
/// The responder's signature is checked against `chain` before any status is
/// read: the signer must be the issuer or a delegate the chain authenticates.
pub fn classify_response(
    response_der: &[u8],
    id: &OcspCertIdRef,
    chain: &[X509],
) -> EnrollResult<RevocationStatus> {
    let response = OcspResponse::from_der(response_der)
        .map_err(|e| EnrollError::Ocsp(format!("unparsable response: {}", e)))?;
    if response.status() != OcspResponseStatus::SUCCESSFUL {
        return Err(EnrollError::Ocsp(format!(
            "responder returned status {}",
            response.status().as_raw()
        )));
    }
    let basic = response
        .basic()
        .map_err(|e| EnrollError::Ocsp(format!("response has no basic body: {}", e)))?;
    verify_responder(&basic, chain)?;

    let status = basic
        .find_status(id)
        .ok_or_else(|| EnrollError::Ocsp("response holds no status for the certificate".to_string()))?;
    status
        .check_validity(VALIDITY_LEEWAY_SECS, None)
        .map_err(|e| EnrollError::Ocsp(format!("stale response: {}", e)))?;

    if status.status == OcspCertStatus::REVOKED {
        return Err(EnrollError::Revoked(format!(
            "revocation reason code {}",
            status.reason.as_raw()
        )));
    }
    if status.status == OcspCertStatus::UNKNOWN {
        warn!("OCSP responder does not know the certificate");
        return Ok(RevocationStatus::Unknown);
    }
    Ok(RevocationStatus::Good)
}

fn verify_responder(basic: &OcspBasicResponseRef, chain: &[X509]) -> EnrollResult<()> {
    let mut store = X509StoreBuilder::new().map_err(tool("Failed to create trust store"))?;
    let mut certs = Stack::new().map_err(tool("Failed to create certificate stack"))?;
    for cert in chain {
        store
            .add_cert(cert.clone())
            .map_err(tool("Failed to add certificate to trust store"))?;
        certs
            .push(cert.clone())
            .map_err(tool("Failed to add certificate to stack"))?;
    }
    let store = store.build();
    basic
        .verify(&certs, &store, OcspFlag::empty())
        .map_err(|e| EnrollError::Ocsp(format!("response signature verification failed: {}", e)))
}

// ================= Responder =================

/// `openssl ocsp` invocation answering from the CA index with the
/// configured responder identity. The caller adds the transport arguments.
///
/// # Errors
/// `Config` when a configured file is missing.
pub fn responder_command(config: &OcspResponderConfig) -> EnrollResult<Command> {
    let signer = existing(&config.signer_cert, "OCSPCERT", "OCSP certificate")?;
    let key = existing(&config.signer_key, "OCSPSK", "OCSP server private key")?;
    let index = existing(&config.index, "CERTDB", "CA's database")?;
    let ca_cert = existing(&config.ca_cert, "CACERT", "CA's certificate")?;

    let mut command = Command::new(&config.openssl);
    command
        .arg("ocsp")
        .arg("-index")
        .arg(index)
        .arg("-rsigner")
        .arg(signer)
        .arg("-rkey")
        .arg(key)
        .arg("-CA")
        .arg(ca_cert);
    Ok(command)
}

/// Serve OCSP requests on `config.port` until the responder exits.
pub fn run_responder(config: &OcspResponderConfig) -> EnrollResult<()> {
    let mut command = responder_command(config)?;
    command.arg("-port").arg(config.port.to_string());
    info!(port = config.port, "starting OCSP responder");
    let status = command
        .status()
        .map_err(io_error(format!("Failed to run {}", config.openssl.display())))?;
    if !status.success() {
        return Err(EnrollError::Ocsp(format!("responder exited with {}", status)));
    }
    Ok(())
}

fn existing(path: &Option<PathBuf>, key: &str, what: &str) -> EnrollResult<PathBuf> {
    match path.as_deref() {
        Some(path) if path.is_file() => Ok(path.to_path_buf()),
        Some(path) => Err(EnrollError::config(format!(
            "path \"{}\" to the {} is invalid or it is not a file",
            path.display(),
            what
        ))),
        None => Err(EnrollError::config(format!("{} is not configured", key))),
    }
}
