//! Enrollment Session Module
//!
//! CA side of one enrollment connection:
//!
//! ```text
//! AwaitCsr → AwaitMsg → AwaitSig → Verify → Issue → Deliver → Done
//!                                     └──────────► Rejected
//! ```
//!
//! The session owns a private scratch directory for the uploaded artifacts
//! and the issued certificate. It is removed when the session is dropped,
//! whichever way the session ends.

use crate::cert_manager::CertManager;
use crate::configs::{CaConfig, CertConfig};
use crate::error::{io_error, socket_error, EnrollError, EnrollResult};
use crate::protocol::{self, DeliveryKind, UploadKind, ACK, FAILED, MAX_READ};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

const SCRATCH_SUBDIR: &str = "tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitCsr,
    AwaitMsg,
    AwaitSig,
    Verify,
    Issue,
    Deliver,
    Done,
    Rejected,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Rejected)
    }

    fn awaits_upload(self) -> bool {
        matches!(self, Self::AwaitCsr | Self::AwaitMsg | Self::AwaitSig)
    }
}

/// One enrollment exchange over `S`.
pub struct EnrollmentSession<S> {
    stream: S,
    state: SessionState,
    manager: CertManager,
    ca_cert: Option<PathBuf>,
    signer_chain: Option<PathBuf>,
    ocsp_url: String,
    received: [bool; 3],
    scratch: TempDir,
}

impl<S: Read + Write> EnrollmentSession<S> {
    /// Prepare a session with its own scratch directory under
    /// `<scratch_root>/tmp/`.
    ///
    /// `cert_config` is the CA's issuing identity; its CSR, certificate,
    /// message and signature paths are redirected into the scratch directory.
    pub fn new(stream: S, config: &CaConfig, cert_config: &CertConfig) -> EnrollResult<Self> {
        let parent = config.scratch_root.join(SCRATCH_SUBDIR);
        fs::create_dir_all(&parent)
            .map_err(io_error(format!("Failed to create {}", parent.display())))?;
        let scratch = tempfile::Builder::new()
            .prefix("session-")
            .tempdir_in(&parent)
            .map_err(io_error(format!("Failed to create session directory in {}", parent.display())))?;

        let mut session_config = cert_config.clone();
        session_config.self_sign = "n".to_string();
        session_config.csr_path = Some(scratch_file(scratch.path(), &config.csr_file));
        session_config.msg_path = Some(scratch_file(scratch.path(), &config.msg_file));
        session_config.sig_path = Some(scratch_file(scratch.path(), &config.sig_file));
        session_config.cert_path = Some(scratch_file(scratch.path(), &config.cert_file));
        session_config.signer_cert = config.signer_cert.clone();
        if config.ca_cert.is_some() {
            session_config.ca_cert = config.ca_cert.clone();
        }

        Ok(Self {
            stream,
            state: SessionState::AwaitCsr,
            manager: CertManager::new(session_config),
            ca_cert: config.ca_cert.clone().or_else(|| cert_config.ca_cert.clone()),
            signer_chain: config.signer_chain.clone(),
            ocsp_url: config.ocsp_url.clone(),
            received: [false; 3],
            scratch,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    /// Drive the session until it reaches a terminal state or the peer leaves.
    ///
    /// # Returns
    /// The state the session stopped in. A peer that disconnects while
    /// uploading leaves the session in its await state.
    ///
    /// # Errors
    /// `Timeout` when the peer stays idle past the socket timeout; issuance
    /// and delivery failures.
    pub fn run(&mut self) -> EnrollResult<SessionState> {
        while !self.state.is_terminal() {
            let next = match self.state {
                state if state.awaits_upload() => match self.receive_upload()? {
                    Some(next) => next,
                    None => {
                        info!(state = ?self.state, "peer closed the connection");
                        return Ok(self.state);
                    }
                },
                SessionState::Verify => self.verify()?,
                SessionState::Issue => self.issue()?,
                SessionState::Deliver => self.deliver()?,
                state => state,
            };
            debug!(from = ?self.state, to = ?next, "session transition");
            self.state = next;
        }
        Ok(self.state)
    }

    /// Read one upload frame, store it and acknowledge it. `None` on EOF.
    fn receive_upload(&mut self) -> EnrollResult<Option<SessionState>> {
        let mut buf = vec![0u8; MAX_READ];
        let n = self
            .stream
            .read(&mut buf)
            .map_err(socket_error("Failed to read from device"))?;
        if n == 0 {
            return Ok(None);
        }

        let Some((kind, payload)) = protocol::parse_upload(&buf[..n]) else {
            debug!(bytes = n, "ignoring frame without an upload marker");
            return Ok(Some(self.state));
        };
        let path = self.upload_path(kind)?;
        fs::write(&path, payload).map_err(io_error(format!("Failed to write {}", path.display())))?;
        info!(artifact = kind.name(), bytes = payload.len(), "received");

        self.stream
            .write_all(ACK)
            .map_err(socket_error("Failed to acknowledge upload"))?;
        self.received[kind as usize] = true;
        Ok(Some(self.next_await_state()))
    }

    fn next_await_state(&self) -> SessionState {
        match self.received {
            [false, _, _] => SessionState::AwaitCsr,
            [true, false, _] => SessionState::AwaitMsg,
            [true, true, false] => SessionState::AwaitSig,
            [true, true, true] => SessionState::Verify,
        }
    }

    fn upload_path(&self, kind: UploadKind) -> EnrollResult<PathBuf> {
        let config = self.manager.config();
        let path = match kind {
            UploadKind::Csr => &config.csr_path,
            UploadKind::Message => &config.msg_path,
            UploadKind::Signature => &config.sig_path,
        };
        path.clone()
            .ok_or_else(|| EnrollError::config(format!("no scratch path for the {}", kind.name())))
    }

    fn verify(&mut self) -> EnrollResult<SessionState> {
        if let Err(e) = self.manager.verify_signature() {
            warn!(error = %e, "signature rejected");
            self.stream
                .write_all(FAILED)
                .map_err(socket_error("Failed to send rejection"))?;
            return Ok(SessionState::Rejected);
        }
        info!("message signature verified");

        // Chain and OCSP failures close the connection without a reply,
        // unlike signature failures which are answered with `failed`.
        let signer_cert = self.manager.config().signer_cert.clone();
        let chain_check = match (&self.signer_chain, &signer_cert) {
            (Some(chain), Some(cert)) => self
                .manager
                .verify_certificate_chain(chain, cert, &self.ocsp_url),
            _ => Err(EnrollError::config(
                "signer's certificate (SIGCERT) or chain (SIGCHAIN) is not configured",
            )),
        };
        if let Err(e) = chain_check {
            if e.is_security_rejection() {
                warn!(error = %e, "signer's certificate rejected");
            } else {
                error!(error = %e, "signer's certificate could not be checked");
            }
            return Ok(SessionState::Rejected);
        }
        info!("signer's certificate chain verified");
        Ok(SessionState::Issue)
    }

    fn issue(&mut self) -> EnrollResult<SessionState> {
        let path = self.manager.create_certificate()?;
        info!(path = %path.display(), "device certificate ready");
        Ok(SessionState::Deliver)
    }

    fn deliver(&mut self) -> EnrollResult<SessionState> {
        let cert_path = self
            .manager
            .config()
            .cert_path
            .clone()
            .ok_or_else(|| EnrollError::config("no scratch path for the device certificate"))?;
        let ca_cert_path = self.ca_cert.clone().ok_or_else(|| {
            error!("CA certificate (CACERT) is not configured");
            EnrollError::config("CA certificate (CACERT) is not configured")
        })?;

        let device_cert = fs::read(&cert_path)
            .map_err(io_error(format!("Failed to read {}", cert_path.display())))?;
        let ca_cert = fs::read(&ca_cert_path)
            .map_err(io_error(format!("Failed to read {}", ca_cert_path.display())))?;

        let frame = protocol::encode_certificate(DeliveryKind::DeviceCert, &device_cert)?;
        self.stream
            .write_all(&frame)
            .map_err(socket_error("Failed to send device certificate"))?;
        let frame = protocol::encode_certificate(DeliveryKind::CaCert, &ca_cert)?;
        self.stream
            .write_all(&frame)
            .map_err(socket_error("Failed to send CA certificate"))?;
        self.stream
            .flush()
            .map_err(socket_error("Failed to flush certificates"))?;
        info!(bytes = device_cert.len() + ca_cert.len(), "certificates delivered");
        Ok(SessionState::Done)
    }
}

fn scratch_file(scratch: &Path, name: &Path) -> PathBuf {
    match name.file_name() {
        Some(file) => scratch.join(file),
        None => scratch.join(name),
    }
}
