//! iot-enroll - X.509 Certificate Enrollment for IoT Devices
//!
//! A private certificate authority provisions devices over a small
//! marker-framed TCP protocol. A device uploads its certificate signing
//! request together with a manufacturer-issued signature over a message
//! file; the CA verifies the signature and the manufacturer's certificate
//! chain (optionally via OCSP), issues a certificate and returns it along
//! with its own certificate.
//!
//! ```text
//! Manufacturer ──signs msg──► Device ──CSR + msg + sig──► CA
//!                                  ◄──device cert + CA cert──
//! ```
//!
//! # Architecture
//!
//! - [`cert_manager`]: key, CSR and certificate lifecycle on OpenSSL
//! - [`cert_db`]: the CA's index of issued certificates
//! - [`ocsp`]: revocation queries and the OCSP responder launcher
//! - [`protocol`]: wire framing and the incremental delivery decoder
//! - [`session`]: per-connection CA state machine
//! - [`ca_server`]: accept loop with one worker thread per connection
//! - [`enroll`]: device side of the protocol
//! - [`device`]: check-or-enroll bootstrap and the secure channel contract
//! - [`configs`]: `KEY = "value"` configuration files
//!
//! # Example Usage
//!
//! ```no_run
//! use iot_enroll::configs::{ConfigStore, DeviceConfig};
//! use iot_enroll::device::Device;
//!
//! fn main() -> anyhow::Result<()> {
//!     let store = ConfigStore::load("clientcnf")?;
//!     let device = Device::new(DeviceConfig::from_store(&store)?);
//!     if device.ensure_certificate()? {
//!         println!("enrolled");
//!     }
//!     Ok(())
//! }
//! ```

pub mod ca_server;
pub mod cert_db;
pub mod cert_manager;
pub mod configs;
pub mod device;
pub mod enroll;
pub mod error;
pub mod logging;
pub mod ocsp;
pub mod protocol;
pub mod session;

pub use error::{EnrollError, EnrollResult, VerificationError};
