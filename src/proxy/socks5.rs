use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::dispatch::Dispatcher;
use crate::error::{ProxyError, Result};

use super::{bridge, mitm};

pub const SOCKS_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// A parsed CONNECT destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
	pub host: String,
	pub port: u16,
}

impl Destination {
	pub fn authority(&self) -> String {
		match (self.host.contains(':'), self.port) {
			(true, p) => format!("[{}]:{}", self.host, p),
			(false, 80) => self.host.clone(),
			(false, p) => format!("{}:{}", self.host, p),
		}
	}
}

/// Drive the SOCKS5 state machine on a freshly accepted connection whose
/// first byte was `0x05`: greeting, request, then the CONNECT tunnel.
/// Reply packets are bit-exact to RFC 1928.
pub async fn run<S>(mut stream: S, dispatcher: Arc<Dispatcher>, client_ip: IpAddr)
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	if let Err(e) = handshake(&mut stream).await {
		tracing::debug!(client = %client_ip, "socks greeting failed: {}", e);
		return;
	}

	let dest = match read_request(&mut stream).await {
		Ok(dest) => dest,
		Err(ProxyError::Protocol(msg)) => {
			tracing::debug!(client = %client_ip, "socks request rejected: {}", msg);
			return;
		}
		Err(e) => {
			tracing::debug!(client = %client_ip, "socks request failed: {}", e);
			return;
		}
	};

	if dest.port == 443 {
		// The tunnel terminates at us; reply success and start forging.
		if write_reply(&mut stream, REP_SUCCESS).await.is_err() {
			return;
		}
		mitm::run_tunnel(stream, dest.host, dispatcher, client_ip).await;
		return;
	}

	let upstream_timeout =
		Duration::from_secs(dispatcher.state.settings.upstream_timeout_secs);
	let connect =
		tokio::time::timeout(upstream_timeout, TcpStream::connect((dest.host.as_str(), dest.port)))
			.await;
	let upstream = match connect {
		Ok(Ok(upstream)) => upstream,
		Ok(Err(e)) => {
			tracing::debug!(host = %dest.host, port = dest.port, "socks connect failed: {}", e);
			let rep = match e.kind() {
				std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::TimedOut => {
					REP_NETWORK_UNREACHABLE
				}
				_ => REP_GENERAL_FAILURE,
			};
			let _ = write_reply(&mut stream, rep).await;
			return;
		}
		Err(_) => {
			let _ = write_reply(&mut stream, REP_NETWORK_UNREACHABLE).await;
			return;
		}
	};

	if write_reply(&mut stream, REP_SUCCESS).await.is_err() {
		return;
	}

	bridge::sniffed_tunnel(stream, upstream, dest.authority(), dispatcher, client_ip).await;
}

/// Greeting: `[ver, nmethods, methods...]`. Only auth-none is acceptable.
async fn handshake<S>(stream: &mut S) -> Result<()>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let ver = stream.read_u8().await?;
	if ver != SOCKS_VERSION {
		return Err(ProxyError::Protocol(format!("bad socks version {:#04x}", ver)));
	}
	let nmethods = stream.read_u8().await?;
	let mut methods = vec![0u8; nmethods as usize];
	stream.read_exact(&mut methods).await?;

	if !methods.contains(&METHOD_NO_AUTH) {
		stream
			.write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
			.await?;
		stream.flush().await?;
		return Err(ProxyError::Protocol("no acceptable auth method".into()));
	}

	stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
	stream.flush().await?;
	Ok(())
}

/// Request: `[ver, cmd, rsv, atyp, addr..., port]`. Replies with the
/// proper failure code before erroring out.
async fn read_request<S>(stream: &mut S) -> Result<Destination>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let mut head = [0u8; 4];
	stream.read_exact(&mut head).await?;
	let [ver, cmd, _rsv, atyp] = head;

	if ver != SOCKS_VERSION {
		return Err(ProxyError::Protocol(format!("bad request version {:#04x}", ver)));
	}
	if cmd != CMD_CONNECT {
		write_reply(stream, REP_COMMAND_NOT_SUPPORTED).await?;
		return Err(ProxyError::Protocol(format!("unsupported command {:#04x}", cmd)));
	}

	let host = match atyp {
		ATYP_IPV4 => {
			let mut addr = [0u8; 4];
			stream.read_exact(&mut addr).await?;
			std::net::Ipv4Addr::from(addr).to_string()
		}
		ATYP_DOMAIN => {
			let len = stream.read_u8().await?;
			let mut name = vec![0u8; len as usize];
			stream.read_exact(&mut name).await?;
			String::from_utf8(name)
				.map_err(|_| ProxyError::Protocol("domain is not UTF-8".into()))?
		}
		ATYP_IPV6 => {
			let mut addr = [0u8; 16];
			stream.read_exact(&mut addr).await?;
			std::net::Ipv6Addr::from(addr).to_string()
		}
		other => {
			write_reply(stream, REP_ATYP_NOT_SUPPORTED).await?;
			return Err(ProxyError::Protocol(format!(
				"unsupported address type {:#04x}",
				other
			)));
		}
	};

	let port = stream.read_u16().await?;
	Ok(Destination { host, port })
}

/// Reply: `[ver, rep, rsv, atyp=IPv4, 0.0.0.0, port 0]`.
async fn write_reply<S>(stream: &mut S, rep: u8) -> Result<()>
where
	S: AsyncWrite + Unpin,
{
	stream
		.write_all(&[SOCKS_VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
		.await?;
	stream.flush().await?;
	Ok(())
}
