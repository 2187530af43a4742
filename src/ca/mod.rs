pub mod leaf_cache;

pub use leaf_cache::LeafCache;

use std::fs;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result as AnyResult};
use chrono::Datelike;
use rcgen::{
	BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
	ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, date_time_ymd,
};
use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use tokio_rustls::rustls::{self, PrivateKey, server::ServerConfig};

use crate::error::{ProxyError, Result};

const CA_KEY_FILE: &str = "ca.key";
const CA_CERT_FILE: &str = "ca.crt";

/// A minted per-host certificate plus its private key, ready to present to
/// an intercepted client.
#[derive(Debug, Clone)]
pub struct LeafCert {
	pub cert_pem: String,
	pub cert_der: Vec<u8>,
	pub key_der: Vec<u8>,
}

/// The root CA used to sign forged leaves.
///
/// Generated once and persisted as `certs/ca.key` + `certs/ca.crt`; both
/// files must exist for a reload, a mixed state triggers regeneration. The
/// leaf signing key is generated per process and shared across hosts (leaf
/// certs differ per host, the key does not need to).
pub struct CertificateAuthority {
	cert_pem: String,
	cert_der: Vec<u8>,
	signer: Certificate,
	leaf_key_pem: String,
	serial: AtomicU64,
}

impl CertificateAuthority {
	/// Load the CA from `dir`, or generate and persist a fresh one. A
	/// persistence failure is fatal and leaves no partial files behind.
	pub fn load_or_create(dir: &Path) -> AnyResult<Self> {
		let key_path = dir.join(CA_KEY_FILE);
		let cert_path = dir.join(CA_CERT_FILE);

		let have_key = key_path.exists();
		let have_cert = cert_path.exists();

		let (key_pem, cert_pem) = if have_key && have_cert {
			let key_pem = fs::read_to_string(&key_path)
				.with_context(|| format!("reading CA key {}", key_path.display()))?;
			let cert_pem = fs::read_to_string(&cert_path)
				.with_context(|| format!("reading CA cert {}", cert_path.display()))?;
			(key_pem, cert_pem)
		} else {
			if have_key != have_cert {
				tracing::warn!(
					dir = %dir.display(),
					"CA material is incomplete (one of key/cert missing); regenerating"
				);
				let _ = fs::remove_file(&key_path);
				let _ = fs::remove_file(&cert_path);
			}
			let (key_pem, cert_pem) = generate_root()?;
			fs::create_dir_all(dir)
				.with_context(|| format!("creating CA dir {}", dir.display()))?;
			write_atomic(&key_path, key_pem.as_bytes())
				.with_context(|| format!("persisting CA key {}", key_path.display()))?;
			if let Err(e) = write_atomic(&cert_path, cert_pem.as_bytes())
				.with_context(|| format!("persisting CA cert {}", cert_path.display()))
			{
				// Do not leave a key without its certificate on disk.
				let _ = fs::remove_file(&key_path);
				return Err(e);
			}
			tracing::info!(dir = %dir.display(), "generated new root CA");
			(key_pem, cert_pem)
		};

		let key_pair = KeyPair::from_pem(&key_pem).context("parsing CA key")?;
		let params = CertificateParams::from_ca_cert_pem(&cert_pem, key_pair)
			.context("parsing CA cert")?;
		let signer = Certificate::from_params(params).context("rebuilding CA signer")?;
		let cert_der = first_cert_der(&cert_pem).context("decoding CA cert PEM")?;

		if let Ok((_, parsed)) = x509_parser::parse_x509_certificate(&cert_der) {
			let not_after = parsed.validity().not_after.to_datetime();
			if not_after <= x509_parser::time::ASN1Time::now().to_datetime() {
				tracing::warn!(
					dir = %dir.display(),
					"persisted CA certificate is expired; clients will reject forged leaves"
				);
			}
		}

		let leaf_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048)
			.context("generating leaf signing key")?;
		let leaf_key_pem = leaf_key
			.to_pkcs8_pem(LineEnding::LF)
			.context("encoding leaf signing key")?
			.to_string();

		Ok(Self {
			cert_pem,
			cert_der,
			signer,
			leaf_key_pem,
			serial: AtomicU64::new(chrono::Utc::now().timestamp_millis() as u64),
		})
	}

	/// The root certificate in PEM form, for installation on clients.
	pub fn root_cert_pem(&self) -> &str {
		&self.cert_pem
	}

	pub fn root_cert_der(&self) -> &[u8] {
		&self.cert_der
	}

	/// Sign a certificate for `host`: CN=host, SANs {host, *.host} (an IP
	/// literal gets an IP SAN), serverAuth, one year validity, serial drawn
	/// from a monotonic timestamp.
	pub fn mint_leaf(&self, host: &str) -> Result<LeafCert> {
		let mut params = CertificateParams::default();
		params.alg = &rcgen::PKCS_RSA_SHA256;

		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, host);
		params.distinguished_name = dn;

		match host.parse::<IpAddr>() {
			Ok(ip) => params.subject_alt_names.push(SanType::IpAddress(ip)),
			Err(_) => {
				params
					.subject_alt_names
					.push(SanType::DnsName(host.to_string()));
				params
					.subject_alt_names
					.push(SanType::DnsName(format!("*.{}", host)));
			}
		}

		params.key_usages = vec![
			KeyUsagePurpose::DigitalSignature,
			KeyUsagePurpose::KeyEncipherment,
		];
		params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

		let year = chrono::Utc::now().year();
		params.not_before = date_time_ymd(year - 1, 12, 31);
		params.not_after = date_time_ymd(year + 1, 12, 31);
		params.serial_number = Some(self.next_serial());

		params.key_pair = Some(
			KeyPair::from_pem(&self.leaf_key_pem)
				.map_err(|e| ProxyError::Tls(format!("leaf key unusable: {}", e)))?,
		);

		let cert = Certificate::from_params(params)
			.map_err(|e| ProxyError::Tls(format!("building leaf cert for {}: {}", host, e)))?;
		let cert_pem = cert
			.serialize_pem_with_signer(&self.signer)
			.map_err(|e| ProxyError::Tls(format!("signing leaf cert for {}: {}", host, e)))?;
		let cert_der = cert
			.serialize_der_with_signer(&self.signer)
			.map_err(|e| ProxyError::Tls(format!("signing leaf cert for {}: {}", host, e)))?;
		let key_der = cert.serialize_private_key_der();

		Ok(LeafCert {
			cert_pem,
			cert_der,
			key_der,
		})
	}

	/// A rustls server config presenting `leaf` with the CA appended to
	/// the chain. TLS 1.2 stays enabled: the whole point is serving
	/// browsers that predate TLS 1.3.
	pub fn server_config_for(&self, leaf: &LeafCert) -> Result<Arc<ServerConfig>> {
		let chain = vec![
			rustls::Certificate(leaf.cert_der.clone()),
			rustls::Certificate(self.cert_der.clone()),
		];
		let cfg = ServerConfig::builder()
			.with_safe_defaults()
			.with_no_client_auth()
			.with_single_cert(chain, PrivateKey(leaf.key_der.clone()))
			.map_err(|e| ProxyError::Tls(format!("building server config: {}", e)))?;
		Ok(Arc::new(cfg))
	}

	fn next_serial(&self) -> u64 {
		let now = chrono::Utc::now().timestamp_millis() as u64;
		self.serial
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
				Some(now.max(last + 1))
			})
			.map(|last| now.max(last + 1))
			.unwrap_or(now)
	}
}

fn generate_root() -> AnyResult<(String, String)> {
	let root_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048)
		.context("generating CA key")?;
	let key_pem = root_key
		.to_pkcs8_pem(LineEnding::LF)
		.context("encoding CA key")?
		.to_string();

	let mut params = CertificateParams::default();
	params.alg = &rcgen::PKCS_RSA_SHA256;
	params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
	params.key_usages = vec![
		KeyUsagePurpose::KeyCertSign,
		KeyUsagePurpose::DigitalSignature,
		KeyUsagePurpose::CrlSign,
	];

	let mut dn = DistinguishedName::new();
	dn.push(DnType::CommonName, "Revamp Proxy Root CA");
	dn.push(DnType::OrganizationName, "Revamp Proxy");
	params.distinguished_name = dn;

	let year = chrono::Utc::now().year();
	params.not_before = date_time_ymd(year - 1, 12, 31);
	params.not_after = date_time_ymd(year + 10, 12, 31);

	params.key_pair =
		Some(KeyPair::from_pem(&key_pem).context("loading generated CA key")?);

	let cert = Certificate::from_params(params).context("self-signing CA cert")?;
	let cert_pem = cert.serialize_pem().context("serializing CA cert")?;
	Ok((key_pem, cert_pem))
}

/// First certificate in a PEM bundle as raw DER.
fn first_cert_der(pem: &str) -> AnyResult<Vec<u8>> {
	let mut reader = BufReader::new(pem.as_bytes());
	let certs = rustls_pemfile::certs(&mut reader)
		.map_err(|e| anyhow::anyhow!("failed to parse PEM certs: {}", e))?;
	certs
		.into_iter()
		.next()
		.ok_or_else(|| anyhow::anyhow!("no certificate found in PEM"))
}

/// Write through a temp file plus rename so interrupted writes never leave
/// partial CA material behind.
fn write_atomic(path: &Path, contents: &[u8]) -> AnyResult<()> {
	let parent = path
		.parent()
		.map(Path::to_path_buf)
		.unwrap_or_else(|| PathBuf::from("."));
	let tmp = parent.join(format!(
		".{}.tmp.{}",
		path.file_name()
			.map(|n| n.to_string_lossy().into_owned())
			.unwrap_or_else(|| "ca".to_string()),
		std::process::id()
	));
	fs::write(&tmp, contents).with_context(|| format!("writing {}", tmp.display()))?;
	if let Err(e) = fs::rename(&tmp, path) {
		let _ = fs::remove_file(&tmp);
		return Err(e).with_context(|| format!("renaming into {}", path.display()));
	}
	Ok(())
}
