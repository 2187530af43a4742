use hyper::StatusCode;
use thiserror::Error;

/// Errors surfaced by the interception pipeline and the control plane.
///
/// The variants map onto the wire behaviour described in the module docs:
/// protocol violations close the connection, upstream/TLS failures become
/// 502s once a client channel exists, transform failures are recovered
/// locally (original bytes are served) and never reach the client.
#[derive(Debug, Error)]
pub enum ProxyError {
	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("TLS error: {0}")]
	Tls(String),

	#[error("upstream error: {0}")]
	Upstream(String),

	#[error("transform failed: {0}")]
	Transform(String),

	#[error("validation failed: {0}")]
	Validation(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("method not allowed")]
	MethodNotAllowed,

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

impl ProxyError {
	/// HTTP status used when this error must be reported to a client that
	/// already has an established HTTP channel.
	pub fn status_code(&self) -> StatusCode {
		match self {
			ProxyError::Protocol(_) => StatusCode::BAD_REQUEST,
			ProxyError::Tls(_) => StatusCode::BAD_GATEWAY,
			ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
			ProxyError::Transform(_) => StatusCode::INTERNAL_SERVER_ERROR,
			ProxyError::Validation(_) => StatusCode::BAD_REQUEST,
			ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
			ProxyError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
			ProxyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

pub type Result<T> = std::result::Result<T, ProxyError>;
