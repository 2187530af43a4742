use crate::error::{ProxyError, Result};

/// The three PAC flavors the control plane serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacVariant {
	Socks5,
	Http,
	Combined,
}

impl PacVariant {
	pub fn from_str(s: &str) -> Result<Self> {
		match s.to_ascii_lowercase().as_str() {
			"socks5" | "socks" => Ok(PacVariant::Socks5),
			"http" => Ok(PacVariant::Http),
			"combined" | "all" => Ok(PacVariant::Combined),
			other => Err(ProxyError::NotFound(format!("pac variant {}", other))),
		}
	}
}

/// Render a PAC file pointing clients at this proxy. Plain requests to the
/// control plane itself stay DIRECT so a half-configured client can always
/// reach the portal.
pub fn render(variant: PacVariant, proxy_host: &str, socks_port: u16, http_port: u16) -> String {
	let route = match variant {
		PacVariant::Socks5 => format!("SOCKS5 {}:{}; SOCKS {}:{}", proxy_host, socks_port, proxy_host, socks_port),
		PacVariant::Http => format!("PROXY {}:{}", proxy_host, http_port),
		PacVariant::Combined => format!(
			"SOCKS5 {}:{}; PROXY {}:{}",
			proxy_host, socks_port, proxy_host, http_port
		),
	};

	format!(
		r#"function FindProxyForURL(url, host) {{
    // Keep loopback and RFC1918 traffic direct.
    if (isPlainHostName(host) ||
        shExpMatch(host, "localhost") ||
        isInNet(dnsResolve(host), "127.0.0.0", "255.0.0.0") ||
        isInNet(dnsResolve(host), "10.0.0.0", "255.0.0.0") ||
        isInNet(dnsResolve(host), "192.168.0.0", "255.255.0.0")) {{
        return "DIRECT";
    }}
    return "{route}; DIRECT";
}}
"#
	)
}
