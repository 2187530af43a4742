use clap::Parser;
use revamp_proxy::config::registry::GlobalConfig;
use revamp_proxy::{config, observability, run};

#[derive(Parser)]
#[command(
	name = "revamp-proxy",
	about = "Intercepting proxy that adapts the modern web for legacy browsers"
)]
struct Cli {
	/// Bind address for all listeners
	#[arg(long)]
	bind: Option<String>,

	/// SOCKS5 listener port
	#[arg(long)]
	socks_port: Option<u16>,

	/// HTTP proxy listener port
	#[arg(long)]
	http_port: Option<u16>,

	/// Captive portal / control plane port
	#[arg(long)]
	portal_port: Option<u16>,

	/// Directory for certs, rules, cache, and logs
	#[arg(long)]
	data_dir: Option<String>,

	/// Target browsers, e.g. "safari 9, ios 9"
	#[arg(long)]
	targets: Option<String>,

	/// Log filter when RUST_LOG is unset
	#[arg(long)]
	log_level: Option<String>,

	/// Emit logs as JSON lines
	#[arg(long)]
	log_json: bool,

	/// Disable JavaScript transformation by default
	#[arg(long)]
	no_transform_js: bool,

	/// Disable CSS transformation by default
	#[arg(long)]
	no_transform_css: bool,

	/// Disable HTML transformation by default
	#[arg(long)]
	no_transform_html: bool,

	/// Disable ad blocking by default
	#[arg(long)]
	no_remove_ads: bool,

	/// Disable tracking blocking by default
	#[arg(long)]
	no_remove_tracking: bool,

	/// Disable polyfill injection by default
	#[arg(long)]
	no_inject_polyfills: bool,

	/// Present the configured legacy User-Agent upstream
	#[arg(long)]
	spoof_user_agent: bool,

	/// Disable the transform cache by default
	#[arg(long)]
	no_cache: bool,

	/// Mirror JSON API responses into the on-disk log tree
	#[arg(long)]
	json_logs: bool,
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();

	let mut settings = match config::load() {
		Ok(settings) => settings,
		Err(e) => {
			eprintln!("warning: failed to load config: {}", e);
			config::Settings::default()
		}
	};

	if let Some(bind) = cli.bind {
		settings.bind = bind;
	}
	if let Some(port) = cli.socks_port {
		settings.socks_port = port;
	}
	if let Some(port) = cli.http_port {
		settings.http_port = port;
	}
	if let Some(port) = cli.portal_port {
		settings.portal_port = port;
	}
	if let Some(dir) = cli.data_dir {
		settings.data_dir = dir;
	}
	if let Some(targets) = cli.targets {
		settings.targets = targets;
	}
	if let Some(level) = cli.log_level {
		settings.log_level = level;
	}
	if cli.log_json {
		settings.log_json = true;
	}

	if let Err(e) = observability::init_logging(&settings.log_level, settings.log_json) {
		eprintln!("warning: failed to initialize logging: {}", e);
	}

	let mut global = GlobalConfig::default();
	global.flags.transform_js = !cli.no_transform_js;
	global.flags.transform_css = !cli.no_transform_css;
	global.flags.transform_html = !cli.no_transform_html;
	global.flags.remove_ads = !cli.no_remove_ads;
	global.flags.remove_tracking = !cli.no_remove_tracking;
	global.flags.inject_polyfills = !cli.no_inject_polyfills;
	global.flags.spoof_user_agent = cli.spoof_user_agent;
	global.flags.cache_enabled = !cli.no_cache;
	global.json_log_enabled = cli.json_logs;

	if let Err(e) = run(settings, global).await {
		tracing::error!("fatal: {:#}", e);
		eprintln!("fatal: {:#}", e);
		std::process::exit(1);
	}
}
