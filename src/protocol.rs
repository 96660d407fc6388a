//! Protocol Module
//!
//! Marker-framed enrollment protocol spoken over one TCP stream per session.
//!
//! ```text
//! device                                  CA
//!   #$c$#<CSR>            ───────────►
//!                         ◄───────────    ok
//!   #$m$#<message>        ───────────►
//!                         ◄───────────    ok
//!   #$s$#<signature>      ───────────►
//!                         ◄───────────    ok
//!                         ◄───────────    failed                      (signature rejected)
//!                         ◄───────────    #$t$#<device cert>#^#*
//!                         ◄───────────    #$a$#<CA cert>#^#*
//! ```
//!
//! There is no length prefix. Uploads are taken as one read each (at most
//! [`MAX_READ`] bytes); certificate delivery is delimited and may arrive in
//! any number of chunks.

use crate::error::{EnrollError, EnrollResult};

pub const CSR_MARKER: &[u8] = b"#$c$#";
pub const MSG_MARKER: &[u8] = b"#$m$#";
pub const SIG_MARKER: &[u8] = b"#$s$#";
pub const CERT_MARKER: &[u8] = b"#$t$#";
pub const CA_CERT_MARKER: &[u8] = b"#$a$#";
pub const END_DELIMITER: &[u8] = b"#^#*";

/// Acknowledgement of one upload.
pub const ACK: &[u8] = b"ok";
/// Enrollment rejected by the CA.
pub const FAILED: &[u8] = b"failed";

/// Largest single read on either side of the connection.
pub const MAX_READ: usize = 4096;

const START_MARKERS: [&[u8]; 5] = [CSR_MARKER, MSG_MARKER, SIG_MARKER, CERT_MARKER, CA_CERT_MARKER];

/// Artifacts a device uploads, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadKind {
    Csr,
    Message,
    Signature,
}

impl UploadKind {
    pub const ALL: [UploadKind; 3] = [Self::Csr, Self::Message, Self::Signature];

    pub fn marker(self) -> &'static [u8] {
        match self {
            Self::Csr => CSR_MARKER,
            Self::Message => MSG_MARKER,
            Self::Signature => SIG_MARKER,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Csr => "CSR",
            Self::Message => "message",
            Self::Signature => "signature",
        }
    }
}

/// Certificates the CA delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    DeviceCert,
    CaCert,
}

impl DeliveryKind {
    pub fn marker(self) -> &'static [u8] {
        match self {
            Self::DeviceCert => CERT_MARKER,
            Self::CaCert => CA_CERT_MARKER,
        }
    }
}

/// Frame an upload: marker followed by the raw payload.
pub fn encode_upload(kind: UploadKind, payload: &[u8]) -> Vec<u8> {
    let marker = kind.marker();
    let mut frame = Vec::with_capacity(marker.len() + payload.len());
    frame.extend_from_slice(marker);
    frame.extend_from_slice(payload);
    frame
}

/// Split a received upload into its kind and payload.
///
/// Returns `None` for anything that does not start with an upload marker.
pub fn parse_upload(frame: &[u8]) -> Option<(UploadKind, &[u8])> {
    UploadKind::ALL
        .into_iter()
        .find_map(|kind| frame.strip_prefix(kind.marker()).map(|payload| (kind, payload)))
}

/// Frame one delivered certificate as `marker payload delimiter`.
///
/// # Errors
/// `Protocol` if the payload contains the end delimiter or any start marker,
/// which would corrupt framing on the receiving side.
pub fn encode_certificate(kind: DeliveryKind, pem: &[u8]) -> EnrollResult<Vec<u8>> {
    if contains(pem, END_DELIMITER) || START_MARKERS.iter().any(|m| contains(pem, m)) {
        return Err(EnrollError::protocol(
            "certificate payload contains a framing marker",
        ));
    }
    let marker = kind.marker();
    let mut frame = Vec::with_capacity(marker.len() + pem.len() + END_DELIMITER.len());
    frame.extend_from_slice(marker);
    frame.extend_from_slice(pem);
    frame.extend_from_slice(END_DELIMITER);
    Ok(frame)
}

/// The two certificates a successful enrollment returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    pub device_cert: Vec<u8>,
    pub ca_cert: Vec<u8>,
}

/// Result of feeding bytes to a [`DeliveryDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeStatus {
    /// More bytes are needed.
    Pending,
    /// The CA answered `failed`.
    Rejected,
    Complete(CertificateBundle),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PayloadState {
    /// Looking for the start marker at or after `from`.
    Seeking { from: usize },
    /// Marker seen; payload starts at `start`, delimiter search resumes at `from`.
    Reading { start: usize, from: usize },
    Done { start: usize, end: usize },
}

impl PayloadState {
    fn advance(&mut self, buffer: &[u8], marker: &[u8]) {
        if let Self::Seeking { from } = *self {
            match find(buffer, marker, from) {
                Some(pos) => {
                    let start = pos + marker.len();
                    *self = Self::Reading { start, from: start };
                }
                None => {
                    *self = Self::Seeking {
                        from: resume_point(buffer.len(), marker.len(), from),
                    }
                }
            }
        }
        if let Self::Reading { start, from } = *self {
            match find(buffer, END_DELIMITER, from) {
                Some(end) => *self = Self::Done { start, end },
                None => {
                    *self = Self::Reading {
                        start,
                        from: resume_point(buffer.len(), END_DELIMITER.len(), from),
                    }
                }
            }
        }
    }

    fn range(&self) -> Option<(usize, usize)> {
        match *self {
            Self::Done { start, end } => Some((start, end)),
            _ => None,
        }
    }

    fn started(&self) -> bool {
        !matches!(self, Self::Seeking { .. })
    }
}

/// Incremental decoder for the certificate delivery.
///
/// Each certificate is tracked by its own two-step state machine (seek the
/// start marker, then seek the delimiter), so chunk boundaries may fall
/// anywhere and the two certificates may arrive in either order.
#[derive(Debug, Clone)]
pub struct DeliveryDecoder {
    buffer: Vec<u8>,
    device: PayloadState,
    ca: PayloadState,
}

impl Default for DeliveryDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            device: PayloadState::Seeking { from: 0 },
            ca: PayloadState::Seeking { from: 0 },
        }
    }

    /// Feed the next chunk read from the CA.
    pub fn push(&mut self, chunk: &[u8]) -> DecodeStatus {
        self.buffer.extend_from_slice(chunk);

        if !self.device.started() && !self.ca.started() && self.buffer == FAILED {
            return DecodeStatus::Rejected;
        }

        self.device.advance(&self.buffer, CERT_MARKER);
        self.ca.advance(&self.buffer, CA_CERT_MARKER);

        match (self.device.range(), self.ca.range()) {
            (Some((ds, de)), Some((cs, ce))) => DecodeStatus::Complete(CertificateBundle {
                device_cert: self.buffer[ds..de].to_vec(),
                ca_cert: self.buffer[cs..ce].to_vec(),
            }),
            _ => DecodeStatus::Pending,
        }
    }

    /// Bytes received so far.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Where to resume a search after a miss so a needle split across chunks is
/// still found.
fn resume_point(len: usize, needle_len: usize, from: usize) -> usize {
    len.saturating_sub(needle_len.saturating_sub(1)).max(from)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle, 0).is_some()
}
