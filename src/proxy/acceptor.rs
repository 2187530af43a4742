use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::dispatch::Dispatcher;
use crate::observability::MetricsRegistry;

use super::{http_entry, socks5};

/// Which protocol a listener primarily speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
	Socks5,
	Http,
}

/// What the first byte of a connection tells us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstByte {
	Socks5,
	Http,
	Unknown,
}

/// Classify the first byte: `0x05` is the SOCKS version byte, and the
/// initial letters of the HTTP method verbs identify misdirected HTTP
/// clients that are tolerated on the SOCKS port.
pub fn classify_first_byte(byte: u8) -> FirstByte {
	match byte {
		0x05 => FirstByte::Socks5,
		b'C' | b'D' | b'G' | b'H' | b'O' | b'P' => FirstByte::Http,
		_ => FirstByte::Unknown,
	}
}

struct ConnectionGuard {
	metrics: Arc<MetricsRegistry>,
}

impl ConnectionGuard {
	fn new(metrics: Arc<MetricsRegistry>) -> Self {
		metrics.connection_opened();
		Self { metrics }
	}
}

impl Drop for ConnectionGuard {
	fn drop(&mut self) {
		self.metrics.connection_closed();
	}
}

/// Accept loop for one listener. Every connection gets its own task; the
/// connection gauges are maintained by a drop guard so they return to
/// baseline on every exit path.
pub async fn serve(listener: TcpListener, role: Role, dispatcher: Arc<Dispatcher>) {
	loop {
		let (stream, peer_addr) = match listener.accept().await {
			Ok(conn) => conn,
			Err(e) => {
				tracing::warn!("accept error: {}", e);
				tokio::time::sleep(Duration::from_millis(100)).await;
				continue;
			}
		};

		let dispatcher = dispatcher.clone();
		let guard = ConnectionGuard::new(dispatcher.state.metrics.clone());

		tokio::spawn(async move {
			let _guard = guard;
			let _ = stream.set_nodelay(true);
			handle_connection(stream, role, dispatcher, peer_addr.ip()).await;
		});
	}
}

async fn handle_connection(
	stream: TcpStream,
	role: Role,
	dispatcher: Arc<Dispatcher>,
	client_ip: IpAddr,
) {
	// Peek (not read) the first byte so nothing is lost on handoff, with
	// the configured idle deadline for silent connections.
	let first_byte_timeout =
		Duration::from_secs(dispatcher.state.settings.first_byte_timeout_secs);
	let mut probe = [0u8; 1];
	let n = match tokio::time::timeout(first_byte_timeout, stream.peek(&mut probe)).await {
		Ok(Ok(n)) => n,
		Ok(Err(e)) => {
			tracing::debug!(client = %client_ip, "first-byte peek failed: {}", e);
			return;
		}
		Err(_) => {
			tracing::debug!(client = %client_ip, "first-byte timeout");
			return;
		}
	};
	if n == 0 {
		return;
	}

	match role {
		Role::Http => http_entry::serve(stream, dispatcher, client_ip).await,
		Role::Socks5 => match classify_first_byte(probe[0]) {
			FirstByte::Socks5 => socks5::run(stream, dispatcher, client_ip).await,
			FirstByte::Http => {
				// Tolerated: an HTTP client pointed at the SOCKS port. The
				// byte was only peeked, so the parser sees the full stream.
				http_entry::serve(stream, dispatcher, client_ip).await
			}
			FirstByte::Unknown => {
				tracing::debug!(
					client = %client_ip,
					byte = probe[0],
					"neither SOCKS nor HTTP, closing"
				);
			}
		},
	}
}
