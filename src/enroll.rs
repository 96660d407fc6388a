//! Enrollment Client Module
//!
//! Device side of the enrollment protocol: upload CSR, message and
//! signature, then collect the device and CA certificates.

use crate::configs::DeviceConfig;
use crate::error::{io_error, socket_error, EnrollError, EnrollResult};
use crate::protocol::{self, CertificateBundle, DecodeStatus, DeliveryDecoder, UploadKind, ACK, MAX_READ};
use std::fs;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

/// Client for one CA.
#[derive(Debug, Clone)]
pub struct EnrollmentClient {
    pub host: String,
    pub port: u16,
    pub csr_path: PathBuf,
    pub msg_path: PathBuf,
    pub sig_path: PathBuf,
    /// Where the issued device certificate is written.
    pub cert_path: PathBuf,
    /// Where the CA certificate is written.
    pub ca_cert_path: PathBuf,
    pub timeout: Duration,
}

impl EnrollmentClient {
    /// Build a client from a device configuration.
    ///
    /// # Errors
    /// `Config` if any of CSR, MSG, SIG, CERT or CACERT is unset.
    pub fn from_config(config: &DeviceConfig) -> EnrollResult<Self> {
        let need = |path: &Option<PathBuf>, key: &str| {
            path.clone()
                .ok_or_else(|| EnrollError::config(format!("{} is not configured", key)))
        };
        Ok(Self {
            host: config.ca_host.clone(),
            port: config.ca_port,
            csr_path: need(&config.csr_path, "CSR")?,
            msg_path: need(&config.msg_path, "MSG")?,
            sig_path: need(&config.sig_path, "SIG")?,
            cert_path: need(&config.cert_path, "CERT")?,
            ca_cert_path: need(&config.ca_cert_path, "CACERT")?,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Run the enrollment exchange.
    ///
    /// Certificate files are only written once both certificates have been
    /// received in full.
    ///
    /// # Errors
    /// * `Config` - a local upload file is missing
    /// * `Protocol` - missing acknowledgement or the CA hung up early
    /// * `Rejected` - the CA refused the request
    /// * `Timeout` - the CA went quiet for longer than the timeout
    pub fn enroll(&self) -> EnrollResult<CertificateBundle> {
        let uploads = [
            (UploadKind::Csr, &self.csr_path),
            (UploadKind::Message, &self.msg_path),
            (UploadKind::Signature, &self.sig_path),
        ];
        for (kind, path) in &uploads {
            if !path.is_file() {
                return Err(EnrollError::config(format!(
                    "{} file \"{}\" doesn't exist or it is not a file",
                    kind.name(),
                    path.display()
                )));
            }
        }

        let mut stream = self.connect()?;
        info!(host = %self.host, port = self.port, "connected to CA");
        let result = self.exchange(&mut stream, &uploads);
        let _ = stream.shutdown(Shutdown::Both);
        result
    }

    /// Connect to the CA, trying each resolved address within `timeout`.
    fn connect(&self) -> EnrollResult<TcpStream> {
        let target = format!("{}:{}", self.host, self.port);
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(io_error(format!("Failed to resolve CA {}", target)))?
            .collect();
        let mut last = EnrollError::config(format!("CA {} resolved to no addresses", target));
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(%addr, error = %e, "connection attempt failed");
                    last = socket_error(format!("Failed to connect to CA {}", target))(e);
                }
            }
        }
        Err(last)
    }

    fn exchange(&self, stream: &mut TcpStream, uploads: &[(UploadKind, &PathBuf)]) -> EnrollResult<CertificateBundle> {
        stream
            .set_read_timeout(Some(self.timeout))
            .and_then(|_| stream.set_write_timeout(Some(self.timeout)))
            .map_err(io_error("Failed to set socket timeout"))?;

        let mut pending = Vec::new();
        for (kind, path) in uploads {
            let payload = fs::read(path).map_err(io_error(format!("Failed to read {}", path.display())))?;
            let frame = protocol::encode_upload(*kind, &payload);
            stream
                .write_all(&frame)
                .map_err(socket_error(format!("Failed to send {}", kind.name())))?;
            info!(artifact = kind.name(), bytes = frame.len(), "sent");
            await_ack(stream, &mut pending)?;
        }

        let mut decoder = DeliveryDecoder::new();
        let mut status = decoder.push(&pending);
        let mut buf = vec![0u8; MAX_READ];
        let bundle = loop {
            match status {
                DecodeStatus::Complete(bundle) => break bundle,
                DecodeStatus::Rejected => return Err(EnrollError::Rejected),
                DecodeStatus::Pending => {}
            }
            let n = stream
                .read(&mut buf)
                .map_err(socket_error("Failed to receive certificates"))?;
            if n == 0 {
                return Err(EnrollError::protocol(format!(
                    "CA closed the connection after {} bytes of certificate data",
                    decoder.buffered()
                )));
            }
            debug!(bytes = n, "certificate data received");
            status = decoder.push(&buf[..n]);
        };

        self.store(&bundle)?;
        info!(
            cert = %self.cert_path.display(),
            ca_cert = %self.ca_cert_path.display(),
            "certificates stored"
        );
        Ok(bundle)
    }

    /// Write both certificates or neither.
    fn store(&self, bundle: &CertificateBundle) -> EnrollResult<()> {
        let cert = stage(&self.cert_path, &bundle.device_cert)?;
        let ca_cert = stage(&self.ca_cert_path, &bundle.ca_cert)?;
        cert.persist(&self.cert_path)
            .map_err(|e| io_error(format!("Failed to write {}", self.cert_path.display()))(e.error))?;
        if let Err(e) = ca_cert.persist(&self.ca_cert_path) {
            if let Err(cleanup) = fs::remove_file(&self.cert_path) {
                warn!(error = %cleanup, "failed to remove device certificate");
            }
            return Err(io_error(format!("Failed to write {}", self.ca_cert_path.display()))(e.error));
        }
        Ok(())
    }
}

/// Wait for `ok`, keeping any bytes that arrive after it in `pending`.
fn await_ack<S: Read>(stream: &mut S, pending: &mut Vec<u8>) -> EnrollResult<()> {
    let mut buf = [0u8; MAX_READ];
    while pending.len() < ACK.len() && ACK.starts_with(pending) {
        let n = stream
            .read(&mut buf)
            .map_err(socket_error("Failed to receive acknowledgement"))?;
        if n == 0 {
            return Err(EnrollError::protocol("CA closed the connection before acknowledging"));
        }
        pending.extend_from_slice(&buf[..n]);
    }
    if !pending.starts_with(ACK) {
        return Err(EnrollError::protocol("CA acknowledgement failed"));
    }
    pending.drain(..ACK.len());
    Ok(())
}

/// Write `data` to a temporary file next to `path`.
fn stage(path: &Path, data: &[u8]) -> EnrollResult<NamedTempFile> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent)
        .map_err(io_error(format!("Failed to create directory {}", parent.display())))?;
    let mut file = NamedTempFile::new_in(parent)
        .map_err(io_error(format!("Failed to create a temporary file in {}", parent.display())))?;
    file.write_all(data)
        .map_err(io_error(format!("Failed to write {}", file.path().display())))?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_certificate, DeliveryKind, FAILED};
    use std::io::Cursor;
    use std::net::TcpListener;
    use std::thread;
    use tempfile::TempDir;

    /// Minimal CA stand-in: acknowledges three uploads, then writes `replies`
    /// one chunk at a time and hangs up.
    fn scripted_ca(replies: Vec<Vec<u8>>) -> (u16, thread::JoinHandle<()>) {
        stalling_ca(replies, Duration::ZERO)
    }

    /// Like [`scripted_ca`], but stays silent for `stall` before hanging up.
    fn stalling_ca(replies: Vec<Vec<u8>>, stall: Duration) -> (u16, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; MAX_READ];
            for _ in 0..3 {
                stream.read(&mut buf).unwrap();
                stream.write_all(ACK).unwrap();
            }
            for reply in replies {
                stream.write_all(&reply).unwrap();
                stream.flush().unwrap();
                thread::sleep(Duration::from_millis(10));
            }
            thread::sleep(stall);
        });
        (port, handle)
    }

    fn client(dir: &TempDir, port: u16) -> EnrollmentClient {
        for name in ["dev.csr", "msg", "sig"] {
            fs::write(dir.path().join(name), name.as_bytes()).unwrap();
        }
        EnrollmentClient {
            host: "127.0.0.1".into(),
            port,
            csr_path: dir.path().join("dev.csr"),
            msg_path: dir.path().join("msg"),
            sig_path: dir.path().join("sig"),
            cert_path: dir.path().join("out").join("dev.cert.pem"),
            ca_cert_path: dir.path().join("out").join("cacert.pem"),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_split_delivery_is_reassembled() {
        let dir = TempDir::new().unwrap();
        let mut delivery = encode_certificate(DeliveryKind::DeviceCert, b"CERTDEV").unwrap();
        delivery.extend(encode_certificate(DeliveryKind::CaCert, b"CERTCA").unwrap());
        let chunks = delivery.chunks(5).map(<[u8]>::to_vec).collect();
        let (port, ca) = scripted_ca(chunks);

        let bundle = client(&dir, port).enroll().unwrap();
        ca.join().unwrap();
        assert_eq!(bundle.device_cert, b"CERTDEV");
        assert_eq!(fs::read(dir.path().join("out/dev.cert.pem")).unwrap(), b"CERTDEV");
        assert_eq!(fs::read(dir.path().join("out/cacert.pem")).unwrap(), b"CERTCA");
    }

    #[test]
    fn test_rejection_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let (port, ca) = scripted_ca(vec![FAILED.to_vec()]);
        let result = client(&dir, port).enroll();
        ca.join().unwrap();
        assert!(matches!(result, Err(EnrollError::Rejected)));
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn test_hang_up_before_delivery_is_protocol_error() {
        let dir = TempDir::new().unwrap();
        let (port, ca) = scripted_ca(vec![b"#$t$#CERT".to_vec()]);
        let result = client(&dir, port).enroll();
        ca.join().unwrap();
        assert!(matches!(result, Err(EnrollError::Protocol(_))));
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn test_silent_ca_mid_delivery_times_out() {
        let dir = TempDir::new().unwrap();
        let partial = encode_certificate(DeliveryKind::DeviceCert, b"CERTDEV").unwrap();
        let (port, ca) = stalling_ca(vec![partial], Duration::from_secs(2));
        let mut client = client(&dir, port);
        client.timeout = Duration::from_millis(300);

        let result = client.enroll();
        ca.join().unwrap();
        assert!(matches!(result, Err(EnrollError::Timeout)), "{:?}", result);
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn test_failed_ca_certificate_write_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let mut delivery = encode_certificate(DeliveryKind::DeviceCert, b"CERTDEV").unwrap();
        delivery.extend(encode_certificate(DeliveryKind::CaCert, b"CERTCA").unwrap());
        let (port, ca) = scripted_ca(vec![delivery]);
        let client = client(&dir, port);
        // a non-empty directory cannot be replaced by the CA certificate
        fs::create_dir_all(client.ca_cert_path.join("occupied")).unwrap();

        let result = client.enroll();
        ca.join().unwrap();
        assert!(matches!(result, Err(EnrollError::Io { .. })), "{:?}", result);
        assert!(!client.cert_path.exists());
        let names: Vec<_> = fs::read_dir(dir.path().join("out"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["cacert.pem".to_string()]);
    }

    #[test]
    fn test_connect_gives_up_after_timeout() {
        let dir = TempDir::new().unwrap();
        let mut client = client(&dir, 9);
        // TEST-NET-1, never routed
        client.host = "192.0.2.1".into();
        client.timeout = Duration::from_millis(200);

        let started = std::time::Instant::now();
        let result = client.enroll();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(
            matches!(result, Err(EnrollError::Timeout) | Err(EnrollError::Io { .. })),
            "{:?}",
            result
        );
    }

    #[test]
    fn test_missing_upload_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir, 1);
        fs::remove_file(&client.sig_path).unwrap();
        assert!(matches!(client.enroll(), Err(EnrollError::Config(_))));
    }

    #[test]
    fn test_ack_handling() {
        let mut pending = Vec::new();
        await_ack(&mut Cursor::new(b"ok#$t$#".to_vec()), &mut pending).unwrap();
        assert_eq!(pending, b"#$t$#");

        let mut pending = Vec::new();
        let result = await_ack(&mut Cursor::new(b"no".to_vec()), &mut pending);
        assert!(matches!(result, Err(EnrollError::Protocol(_))));

        let mut pending = Vec::new();
        let result = await_ack(&mut Cursor::new(b"o".to_vec()), &mut pending);
        assert!(matches!(result, Err(EnrollError::Protocol(_))));
    }
}
