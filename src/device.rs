//! Device Module
//!
//! Certificate bootstrap for a device and the contract of the secure
//! datagram channel it opens once provisioned. The channel itself (DTLS) is
//! supplied by an implementation of [`SecureChannel`] / [`SecureListener`].

use crate::cert_manager::CertManager;
use crate::configs::DeviceConfig;
use crate::enroll::EnrollmentClient;
use crate::error::{EnrollError, EnrollResult};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Message that ends a conversation.
pub const QUIT_MESSAGE: &[u8] = b"q";
/// Largest datagram accepted from the peer.
pub const MAX_DATAGRAM: usize = 1024;

/// A device that provisions itself from the CA when needed.
#[derive(Debug, Clone)]
pub struct Device {
    config: DeviceConfig,
}

impl Device {
    pub fn new(config: DeviceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Make sure the device holds a usable certificate, enrolling if not.
    ///
    /// The local certificate must pair with the private key and chain to the
    /// CA certificate, and the CA certificate must chain to `CACHAIN` when it
    /// is configured. Otherwise a key is created if missing, the CSR is
    /// regenerated and the device enrolls with the CA.
    ///
    /// # Returns
    /// `true` when a new certificate was obtained.
    pub fn ensure_certificate(&self) -> EnrollResult<bool> {
        let manager = CertManager::new(self.config.cert_config());
        match self.check_local(&manager) {
            Ok(()) => {
                info!("device certificate is valid");
                return Ok(false);
            }
            Err(e) => info!(reason = %e, "device certificate unusable, enrolling"),
        }

        let key_missing = manager
            .config()
            .key_path
            .as_ref()
            .map_or(true, |key| !key.exists());
        if key_missing {
            manager.create_key()?;
        }
        manager.create_csr()?;
        EnrollmentClient::from_config(&self.config)?.enroll()?;
        info!("device enrolled");
        Ok(true)
    }

    fn check_local(&self, manager: &CertManager) -> EnrollResult<()> {
        manager.verify_key_pair()?;
        let cert = required(&self.config.cert_path, "CERT")?;
        let ca_cert = required(&self.config.ca_cert_path, "CACERT")?;
        manager.verify_certificate_chain(&ca_cert, &cert, "")?;
        if let Some(chain) = &self.config.ca_chain {
            manager.verify_certificate_chain(chain, &ca_cert, "")?;
        }
        Ok(())
    }
}

fn required(path: &Option<PathBuf>, key: &str) -> EnrollResult<PathBuf> {
    path.clone()
        .ok_or_else(|| EnrollError::config(format!("{} is not configured", key)))
}

// ================= Secure Channel Contract =================

/// Which end of the channel the device plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl FromStr for Role {
    type Err = EnrollError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(Self::Client),
            "server" => Ok(Self::Server),
            other => Err(EnrollError::config(format!(
                "TYPE must be \"client\" or \"server\", got \"{}\"",
                other
            ))),
        }
    }
}

/// Peer certificate policy of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertRequirement {
    None,
    Optional,
    #[default]
    Required,
}

impl FromStr for CertRequirement {
    type Err = EnrollError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "CERT_NONE" => Ok(Self::None),
            "CERT_OPTIONAL" => Ok(Self::Optional),
            "" | "CERT_REQUIRED" => Ok(Self::Required),
            other => Err(EnrollError::config(format!("unknown CERT_REQS value \"{}\"", other))),
        }
    }
}

/// Everything a channel implementation needs to wrap a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSettings {
    pub role: Role,
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
    pub ca_cert_path: PathBuf,
    pub cert_requirement: CertRequirement,
    /// Address the server binds or the client connects to.
    pub server_host: String,
    pub server_port: u16,
}

impl ChannelSettings {
    pub fn from_config(config: &DeviceConfig) -> EnrollResult<Self> {
        Ok(Self {
            role: config.role.parse()?,
            key_path: required(&config.key_path, "SK")?,
            cert_path: required(&config.cert_path, "CERT")?,
            ca_cert_path: required(&config.ca_cert_path, "CACERT")?,
            cert_requirement: config.cert_reqs.parse()?,
            server_host: config.server_host.clone(),
            server_port: config.server_port,
        })
    }
}

/// An established, authenticated datagram channel.
pub trait SecureChannel {
    /// Send one message, returning the number of bytes sent.
    fn send(&mut self, data: &[u8]) -> EnrollResult<usize>;

    /// Receive one message of at most `max_len` bytes.
    fn receive(&mut self, max_len: usize) -> EnrollResult<Vec<u8>>;

    fn close(&mut self) -> EnrollResult<()>;
}

/// Server side of the channel.
pub trait SecureListener {
    type Channel: SecureChannel;

    fn accept(&mut self) -> EnrollResult<(Self::Channel, SocketAddr)>;
}

/// Opens channels from [`ChannelSettings`].
pub trait ChannelProvider {
    type Channel: SecureChannel;
    type Listener: SecureListener<Channel = Self::Channel>;

    fn connect(&self, settings: &ChannelSettings) -> EnrollResult<Self::Channel>;

    fn listen(&self, settings: &ChannelSettings) -> EnrollResult<Self::Listener>;
}

/// Exchange messages over an open channel until either side sends `q`.
///
/// A client sends first and waits for a reply after each message; a server
/// waits first and answers each message with the next outgoing one. The
/// channel is closed on return.
///
/// # Returns
/// Messages received from the peer, in order.
///
/// # Errors
/// `Protocol` when an outgoing message is empty.
pub fn converse<C, I>(channel: &mut C, role: Role, outgoing: I) -> EnrollResult<Vec<Vec<u8>>>
where
    C: SecureChannel,
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    let result = exchange(channel, role, outgoing);
    if let Err(e) = channel.close() {
        warn!(error = %e, "failed to close secure channel");
    }
    result
}

fn exchange<C, I>(channel: &mut C, role: Role, outgoing: I) -> EnrollResult<Vec<Vec<u8>>>
where
    C: SecureChannel,
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    let mut received = Vec::new();

    if role == Role::Server && !receive_one(channel, &mut received)? {
        return Ok(received);
    }
    for message in outgoing {
        let message = message.as_ref();
        if message.is_empty() {
            return Err(EnrollError::protocol("refusing to send an empty message"));
        }
        let sent = channel.send(message)?;
        debug!(bytes = sent, "message sent");
        if message == QUIT_MESSAGE {
            break;
        }
        if !receive_one(channel, &mut received)? {
            break;
        }
    }
    Ok(received)
}

/// Receive one message; `false` when the peer ended the conversation.
fn receive_one<C: SecureChannel>(channel: &mut C, received: &mut Vec<Vec<u8>>) -> EnrollResult<bool> {
    let message = channel.receive(MAX_DATAGRAM)?;
    if message == QUIT_MESSAGE {
        info!("peer ended the conversation");
        return Ok(false);
    }
    info!(bytes = message.len(), "message received");
    received.push(message);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::ConfigStore;
    use std::collections::VecDeque;

    /// In-memory channel replaying scripted peer messages.
    #[derive(Default)]
    struct LoopbackChannel {
        inbound: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
        closed: bool,
    }

    impl SecureChannel for LoopbackChannel {
        fn send(&mut self, data: &[u8]) -> EnrollResult<usize> {
            self.sent.push(data.to_vec());
            Ok(data.len())
        }

        fn receive(&mut self, max_len: usize) -> EnrollResult<Vec<u8>> {
            let mut message = self
                .inbound
                .pop_front()
                .ok_or_else(|| EnrollError::protocol("peer went away"))?;
            message.truncate(max_len);
            Ok(message)
        }

        fn close(&mut self) -> EnrollResult<()> {
            self.closed = true;
            Ok(())
        }
    }

    fn channel(inbound: &[&str]) -> LoopbackChannel {
        LoopbackChannel {
            inbound: inbound.iter().map(|m| m.as_bytes().to_vec()).collect(),
            ..LoopbackChannel::default()
        }
    }

    #[test]
    fn test_client_quits() {
        let mut ch = channel(&["pong-1", "pong-2"]);
        let received = converse(&mut ch, Role::Client, ["ping-1", "ping-2", "q"]).unwrap();
        assert_eq!(received, vec![b"pong-1".to_vec(), b"pong-2".to_vec()]);
        assert_eq!(ch.sent.last().unwrap(), b"q");
        assert!(ch.closed);
    }

    #[test]
    fn test_server_stops_when_peer_quits() {
        let mut ch = channel(&["hello", "q"]);
        let received = converse(&mut ch, Role::Server, ["hi", "unused"]).unwrap();
        assert_eq!(received, vec![b"hello".to_vec()]);
        assert_eq!(ch.sent, vec![b"hi".to_vec()]);
    }

    #[test]
    fn test_empty_message_is_refused() {
        let mut ch = channel(&[]);
        let result = converse(&mut ch, Role::Client, [""]);
        assert!(matches!(result, Err(EnrollError::Protocol(_))));
        assert!(ch.closed);
    }

    #[test]
    fn test_channel_settings_from_config() {
        let store = ConfigStore::from_text(
            "TYPE = \"server\"\nCERT_REQS = \"CERT_OPTIONAL\"\nSK = \"/d/k.pem\"\nCERT = \"/d/c.pem\"\nCACERT = \"/d/ca.pem\"\nSERVERPORT = \"20220\"\n",
        );
        let settings = ChannelSettings::from_config(&DeviceConfig::from_store(&store).unwrap()).unwrap();
        assert_eq!(settings.role, Role::Server);
        assert_eq!(settings.cert_requirement, CertRequirement::Optional);
        assert_eq!(settings.server_host, "::1");
        assert_eq!(settings.server_port, 20220);
    }

    #[test]
    fn test_invalid_channel_settings() {
        assert!(matches!("peer".parse::<Role>(), Err(EnrollError::Config(_))));
        assert!(matches!(
            "CERT_SOMETIMES".parse::<CertRequirement>(),
            Err(EnrollError::Config(_))
        ));
        assert_eq!("".parse::<CertRequirement>().unwrap(), CertRequirement::Required);
    }
}
