use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use portway::{
	ForwardConfig, ProxyRegistry, ProxySetup, RpcServer, ServerConfig, ServerEvent, ServiceEntry,
	Socks5ProxyConfig, TlsServerConfig, UpstreamAddr, WsRouteTable,
};
use portway_core::{signal, telemetry};
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "portway", version, about = "RPC server and traffic proxy on one port")]
struct Args {
	/// Reactor thread count
	#[arg(short, long, default_value_t = 8)]
	threads: usize,

	/// Listening port
	#[arg(short, long, default_value_t = 32000)]
	port: u16,

	/// JSON config file (TLS material, proxy registry, routes)
	#[arg(short, long)]
	config: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
	#[serde(default)]
	idle_timeout_ms: Option<u64>,
	#[serde(default)]
	max_body: Option<u64>,
	#[serde(default)]
	tls: Option<FileTls>,
	#[serde(default)]
	proxy: Option<FileProxy>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTls {
	cert: PathBuf,
	key: PathBuf,
	#[serde(default)]
	client_ca: Option<PathBuf>,
	#[serde(default)]
	require: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileProxy {
	#[serde(default)]
	services: HashMap<String, FileService>,
	#[serde(default)]
	routes: HashMap<String, FileUpstream>,
	#[serde(default)]
	socks5: Option<FileSocks5>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileService {
	token: String,
	#[serde(default)]
	fields: HashMap<String, FileUpstream>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileUpstream {
	host: String,
	service: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSocks5 {
	host: String,
	port: String,
	#[serde(default)]
	username: Option<String>,
	#[serde(default)]
	password: Option<String>,
}

fn main() -> anyhow::Result<()> {
	telemetry::setup_logging();
	let args = match Args::try_parse() {
		Ok(args) => args,
		Err(e) => {
			let _ = e.print();
			std::process::exit(if e.use_stderr() { 1 } else { 0 });
		},
	};

	let file_config = match &args.config {
		Some(path) => {
			let contents = std::fs::read_to_string(path)?;
			serde_json::from_str::<FileConfig>(&contents)?
		},
		None => FileConfig::default(),
	};

	tokio::runtime::Builder::new_multi_thread()
		.worker_threads(args.threads.max(1))
		.enable_all()
		.build()?
		.block_on(run(args, file_config))
}

async fn run(args: Args, file_config: FileConfig) -> anyhow::Result<()> {
	let mut cfg = ServerConfig::new(args.port);
	if let Some(ms) = file_config.idle_timeout_ms {
		cfg = cfg.idle_timeout(Duration::from_millis(ms));
	}
	if let Some(max_body) = file_config.max_body {
		cfg = cfg.max_body(max_body);
	}
	if let Some(tls) = &file_config.tls {
		let mut tls_cfg = TlsServerConfig::new(&tls.cert, &tls.key);
		tls_cfg.client_ca_path = tls.client_ca.clone();
		tls_cfg.require_tls = tls.require;
		cfg = cfg.tls(tls_cfg);
	}
	if let Some(proxy) = file_config.proxy {
		cfg = cfg.proxy(build_proxy(proxy));
	}

	let mut server = RpcServer::bind(cfg)?;
	server.on_event(|event| match event {
		ServerEvent::MisroutedPublish { key } => {
			warn!(key = %key, "publish for key without subscribers")
		},
		ServerEvent::ConnectionError { conn_id, message } => {
			warn!(conn = conn_id, message = %message, "connection error")
		},
	});
	let handle = server.handle();
	info!(port = args.port, threads = args.threads, "starting portway");

	let server_task = tokio::spawn(server.run());
	signal::Shutdown::new().wait().await;
	handle.shutdown();
	server_task.await??;
	Ok(())
}

fn build_proxy(proxy: FileProxy) -> ProxySetup {
	let registry = Arc::new(ProxyRegistry::default());
	for (name, service) in proxy.services {
		let mut entry = ServiceEntry::new(service.token);
		for (field, upstream) in service.fields {
			entry = entry.field(field, UpstreamAddr::new(upstream.host, upstream.service));
		}
		registry.insert(name, entry);
	}
	let routes = Arc::new(WsRouteTable::default());
	for (path, upstream) in proxy.routes {
		routes.add_route(path, UpstreamAddr::new(upstream.host, upstream.service));
	}
	let forward = ForwardConfig {
		socks5: proxy.socks5.map(|s| Socks5ProxyConfig {
			host: s.host,
			port: s.port,
			username: s.username,
			password: s.password,
		}),
		tls: None,
	};
	ProxySetup::new(registry).routes(routes).forward(forward)
}
