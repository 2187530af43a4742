use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

use crate::dispatch::Dispatcher;

/// A stream that replays an already-consumed prefix before handing reads
/// to the inner stream. Protocol handoffs must not lose bytes: whatever
/// was read while sniffing is re-presented here.
pub struct PrefixedStream<S> {
	prefix: Vec<u8>,
	pos: usize,
	inner: S,
}

impl<S> PrefixedStream<S> {
	pub fn new(prefix: Vec<u8>, inner: S) -> Self {
		Self {
			prefix,
			pos: 0,
			inner,
		}
	}
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		if self.pos < self.prefix.len() {
			let remaining = &self.prefix[self.pos..];
			let take = remaining.len().min(buf.remaining());
			buf.put_slice(&remaining[..take]);
			self.pos += take;
			return Poll::Ready(Ok(()));
		}
		Pin::new(&mut self.inner).poll_read(cx, buf)
	}
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<std::io::Result<usize>> {
		Pin::new(&mut self.inner).poll_write(cx, buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.inner).poll_flush(cx)
	}

	fn poll_shutdown(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.inner).poll_shutdown(cx)
	}
}

const HTTP_METHODS: &[&str] = &[
	"GET ", "POST ", "PUT ", "HEAD ", "DELETE ", "OPTIONS ", "PATCH ", "CONNECT ", "TRACE ",
];

/// Does this sniffed prefix open like an HTTP/1.x request line?
pub fn looks_like_http(prefix: &[u8]) -> bool {
	HTTP_METHODS.iter().any(|m| {
		let m = m.as_bytes();
		if prefix.len() >= m.len() {
			prefix.starts_with(m)
		} else {
			m.starts_with(prefix) && !prefix.is_empty()
		}
	})
}

/// Drive a non-443 tunnel: sniff the first client bytes, then either serve
/// it as rewritable HTTP (through the dispatcher) or fall back to a raw
/// byte bridge against the already-connected upstream socket.
pub async fn sniffed_tunnel<S>(
	mut client: S,
	mut upstream: TcpStream,
	authority: String,
	dispatcher: Arc<Dispatcher>,
	client_ip: IpAddr,
) where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let mut prefix = vec![0u8; 2048];
	let n = match tokio::time::timeout(Duration::from_secs(10), client.read(&mut prefix)).await {
		Ok(Ok(0)) | Err(_) => return,
		Ok(Ok(n)) => n,
		Ok(Err(e)) => {
			tracing::debug!("tunnel first read failed: {}", e);
			return;
		}
	};
	prefix.truncate(n);

	if looks_like_http(&prefix) {
		// HTTP in the clear: route each request through the dispatcher so
		// it gets the same blocking and transform treatment as everything
		// else. The upstream socket is abandoned; fetches go through the
		// upstream client.
		drop(upstream);
		let io = TokioIo::new(PrefixedStream::new(prefix, client));
		let service = service_fn(move |req| {
			let dispatcher = dispatcher.clone();
			let authority = authority.clone();
			async move {
				Ok::<_, std::convert::Infallible>(
					dispatcher
						.handle(req, client_ip, "http", Some(&authority))
						.await,
				)
			}
		});
		let builder = AutoBuilder::new(TokioExecutor::new());
		if let Err(e) = builder
			.serve_connection(io, service)
			.await
		{
			tracing::debug!("tunnel http serve ended: {}", e);
		}
		return;
	}

	// Opaque protocol: replay the sniffed prefix upstream and splice.
	if let Err(e) = upstream.write_all(&prefix).await {
		tracing::debug!("tunnel prefix replay failed: {}", e);
		return;
	}
	match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
		Ok((up, down)) => {
			tracing::debug!(up_bytes = up, down_bytes = down, "raw tunnel closed");
		}
		Err(e) => tracing::debug!("raw tunnel error: {}", e),
	}
}
