//! iot-enroll - Certificate enrollment for IoT devices
//!
//! Runs the private CA's enrollment server, enrolls devices against it and
//! exposes the individual certificate operations.
//!
//! # Quick Start
//!
//! ```bash
//! # Create the CA database and self-signed CA certificate
//! iot-enroll init-ca --config certcnf
//!
//! # Serve enrollment requests
//! iot-enroll ca --config appcacnf --cert-config certcnf
//!
//! # On the device: check the local certificate, enroll when needed
//! iot-enroll provision --config clientcnf
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use iot_enroll::ca_server::CaServer;
use iot_enroll::cert_db::CertDatabase;
use iot_enroll::cert_manager::CertManager;
use iot_enroll::configs::{
    CaConfig, CertConfig, ConfigStore, DeviceConfig, OcspResponderConfig, CA_KEYS, CERT_KEYS,
    DEVICE_KEYS, OCSP_KEYS,
};
use iot_enroll::device::Device;
use iot_enroll::enroll::EnrollmentClient;
use iot_enroll::logging::{init_logging, LogFormat};
use iot_enroll::ocsp;
use std::path::{Path, PathBuf};

const CA_CONFIG: &str = "appcacnf";
const CERT_CONFIG: &str = "certcnf";
const DEVICE_CONFIG: &str = "clientcnf";
const OCSP_CONFIG: &str = "ocspcnf";

#[derive(Parser, Debug)]
#[command(
    name = "iot-enroll",
    version,
    about = "X.509 certificate enrollment for IoT devices",
    propagate_version = true
)]
struct Cli {
    /// Configuration file (default depends on the command)
    #[arg(short, long, global = true, env = "IOT_ENROLL_CONFIG")]
    config: Option<PathBuf>,

    /// Override and persist a configuration value, as KEY=VALUE
    #[arg(long = "set", value_name = "KEY=VALUE", global = true)]
    overrides: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "IOT_ENROLL_LOG_LEVEL", global = true)]
    log_level: String,

    /// Log format (text, json, compact)
    #[arg(long, default_value = "text", env = "IOT_ENROLL_LOG_FORMAT", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the CA enrollment server
    Ca {
        /// Certificate configuration of the CA identity
        #[arg(long, default_value = CERT_CONFIG)]
        cert_config: PathBuf,
    },

    /// Create the CA database and the self-signed CA certificate
    #[command(name = "init-ca")]
    InitCa,

    /// Run an OCSP responder (`openssl ocsp`) answering from the CA database
    Ocsp,

    /// Request a certificate from the CA using existing CSR, message and signature
    Enroll,

    /// Verify the device certificate and enroll when it is missing or invalid
    Provision,

    /// Individual certificate operations
    #[command(subcommand)]
    Cert(CertCommand),
}

#[derive(Subcommand, Debug)]
enum CertCommand {
    /// Generate a new EC private key
    Keygen,
    /// Generate a certificate signing request
    Csr,
    /// Create a self-signed or CA-issued certificate
    Create,
    /// Look up the certificate issued for the CSR's subject
    Find,
    /// Check that the certificate matches the private key
    #[command(name = "verify-pair")]
    VerifyPair,
    /// Sign the message file
    Sign,
    /// Verify the message signature with the signer's certificate
    #[command(name = "verify-sig")]
    VerifySig,
    /// Verify a certificate against a chain, optionally checking OCSP
    #[command(name = "verify-chain")]
    VerifyChain {
        /// Trust chain (default: CACHAIN)
        #[arg(long)]
        chain: Option<PathBuf>,
        /// Certificate to verify (default: CERT)
        #[arg(long)]
        cert: Option<PathBuf>,
        /// OCSP responder URL (default: OCSP)
        #[arg(long)]
        ocsp: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format);

    match &cli.command {
        Commands::Ca { cert_config } => run_ca(&cli, cert_config),
        Commands::InitCa => init_ca(&cli),
        Commands::Ocsp => {
            let store = load_store(&cli, OCSP_CONFIG, OCSP_KEYS)?;
            let config = OcspResponderConfig::from_store(&store)?;
            println!("✓ OCSP responder starting on port {}", config.port);
            ocsp::run_responder(&config).context("OCSP responder failed")?;
            Ok(())
        }
        Commands::Enroll => {
            let store = load_store(&cli, DEVICE_CONFIG, DEVICE_KEYS)?;
            let client = EnrollmentClient::from_config(&DeviceConfig::from_store(&store)?)?;
            client.enroll().context("Enrollment failed")?;
            println!("✓ Certificate stored at {}", client.cert_path.display());
            println!("✓ CA certificate stored at {}", client.ca_cert_path.display());
            Ok(())
        }
        Commands::Provision => {
            let store = load_store(&cli, DEVICE_CONFIG, DEVICE_KEYS)?;
            let device = Device::new(DeviceConfig::from_store(&store)?);
            if device.ensure_certificate().context("Provisioning failed")? {
                println!("✓ Device enrolled");
            } else {
                println!("✓ Device certificate is valid");
            }
            Ok(())
        }
        Commands::Cert(command) => run_cert(&cli, command),
    }
}

fn load_store(cli: &Cli, default: &str, keys: &[&str]) -> Result<ConfigStore> {
    let path = cli.config.clone().unwrap_or_else(|| PathBuf::from(default));
    let mut store = ConfigStore::load(&path)?;
    if store.apply_overrides(&cli.overrides, keys)? > 0 {
        store
            .persist()
            .with_context(|| format!("Failed to update {}", path.display()))?;
    }
    Ok(store)
}

fn run_ca(cli: &Cli, cert_config: &Path) -> Result<()> {
    let store = load_store(cli, CA_CONFIG, CA_KEYS)?;
    let config = CaConfig::from_store(&store)?;
    let cert_store = ConfigStore::load(cert_config)?;
    let identity = CertConfig::from_store(&cert_store)?;

    let server = CaServer::bind(config, identity).context("Failed to start CA server")?;
    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || shutdown.trigger()).context("Failed to install Ctrl-C handler")?;
    println!("✓ CA listening on {}", server.local_addr()?);
    server.run()?;
    Ok(())
}

fn init_ca(cli: &Cli) -> Result<()> {
    let store = load_store(cli, CERT_CONFIG, CERT_KEYS)?;
    let mut config = CertConfig::from_store(&store)?;
    let index = config
        .cert_db
        .clone()
        .context("CERTDB or CAPATH must be configured")?;
    let certs = config
        .certs_dir
        .clone()
        .context("CERTS or CAPATH must be configured")?;
    let serial = config.serial_file().context("SERIAL must be configured")?;
    CertDatabase::init(&index, &certs, &serial)?;
    println!("✓ Certificate database created at {}", index.display());

    config.self_sign = "y".to_string();
    if config.key_path.is_none() {
        config.key_path = config.ca_key.clone();
    }
    if config.cert_path.is_none() {
        config.cert_path = config.ca_cert.clone();
    }
    let cert = CertManager::new(config)
        .create_certificate()
        .context("Failed to create CA certificate")?;
    println!("✓ CA certificate created at {}", cert.display());
    Ok(())
}

fn run_cert(cli: &Cli, command: &CertCommand) -> Result<()> {
    let store = load_store(cli, CERT_CONFIG, CERT_KEYS)?;
    let config = CertConfig::from_store(&store)?;
    let manager = CertManager::new(config.clone());

    match command {
        CertCommand::Keygen => println!("✓ Private key: {}", manager.create_key()?.display()),
        CertCommand::Csr => println!("✓ CSR: {}", manager.create_csr()?.display()),
        CertCommand::Create => {
            println!("✓ Certificate: {}", manager.create_certificate()?.display())
        }
        CertCommand::Find => match manager.find_certificate()? {
            Some(path) => println!("{}", path.display()),
            None => println!("No certificate issued for this subject"),
        },
        CertCommand::VerifyPair => {
            manager.verify_key_pair()?;
            println!("✓ Certificate and private key match");
        }
        CertCommand::Sign => println!("✓ Signature: {}", manager.sign_message()?.display()),
        CertCommand::VerifySig => {
            manager.verify_signature()?;
            println!("✓ Signature is valid");
        }
        CertCommand::VerifyChain { chain, cert, ocsp } => {
            let chain = chain
                .clone()
                .or(config.ca_chain)
                .context("No chain given and CACHAIN is not configured")?;
            let cert = cert
                .clone()
                .or(config.cert_path)
                .context("No certificate given and CERT is not configured")?;
            let ocsp = ocsp.clone().unwrap_or(config.ocsp_url);
            manager.verify_certificate_chain(&chain, &cert, &ocsp)?;
            println!("✓ Certificate verified");
        }
    }
    Ok(())
}
