//! haze-nwc CLI - pairing and relay tooling for the wallet-connect bridge
//!
//!   haze-nwc pair <app> [--relay <url>]   → create a pairing, print the connection URI
//!   haze-nwc list                         → persisted pairings
//!   haze-nwc announce                     → publish the capability info event
//!   haze-nwc relays                       → configured relays
//!   haze-nwc adverts                      → stream federation advertisements
//!
//! The service identity comes from `--mnemonic` or `HAZE_MNEMONIC`.
//! Output is JSON (pretty on a terminal).

use haze_nwc::config::Settings;
use haze_nwc::discovery::{FEDERATION_TAG, INVITE_TAG};
use haze_nwc::logging::init_logging;
use haze_nwc::nostr::{first_tag_value, kinds, RelayNotification};
use haze_nwc::nwc::message::advertised_capabilities;
use haze_nwc::{
    install_signal_handlers, ConnectionRegistry, EventCodec, EventFilter, FileStore, KvStore, NwcConfig,
    RelayPool, RelayTransport, ServiceIdentity,
};
use serde_json::{json, Value};
use std::env;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

fn main() {
    init_logging();
    let _ = rustls::crypto::ring::default_provider().install_default();

    let args: Vec<String> = env::args().collect();
    let opts = ParsedArgs::parse(&args[1..]);

    if opts.help {
        print_usage();
        return;
    }
    if opts.version {
        println!("haze-nwc {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let result = match opts.command.as_deref() {
        Some("pair") => cmd_pair(&opts),
        Some("list") | Some("ls") => cmd_list(&opts),
        Some("relays") => cmd_relays(&opts),
        Some("announce") => run_async(cmd_announce(&opts)),
        Some("adverts") => run_async(cmd_adverts(&opts)),
        Some(cmd) => Err(format!("Unknown command: {}", cmd)),
        None => {
            print_usage();
            return;
        }
    };

    let pretty = opts.pretty || std::io::stdout().is_terminal();
    match result {
        Ok(output) => println!("{}", render(&output, pretty)),
        Err(e) => {
            eprintln!("{}", render(&json!({ "error": e }), pretty));
            std::process::exit(1);
        }
    }
}

fn render(value: &Value, pretty: bool) -> String {
    let rendered = if pretty { serde_json::to_string_pretty(value) } else { serde_json::to_string(value) };
    rendered.unwrap_or_else(|_| value.to_string())
}

fn run_async<F: std::future::Future<Output = Result<Value, String>>>(fut: F) -> Result<Value, String> {
    tokio::runtime::Runtime::new()
        .map_err(|e| format!("Failed to start runtime: {}", e))?
        .block_on(fut)
}

#[derive(Default)]
struct ParsedArgs {
    command: Option<String>,
    app: Option<String>,
    relay: Option<String>,
    mnemonic: Option<String>,
    data_dir: Option<String>,
    pretty: bool,
    help: bool,
    version: bool,
}

impl ParsedArgs {
    fn parse(args: &[String]) -> Self {
        load_dotenv();

        let mut opts = ParsedArgs::default();
        let mut positional = Vec::new();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--help" | "-h" => opts.help = true,
                "--version" | "-V" => opts.version = true,
                "--pretty" => opts.pretty = true,
                "--relay" | "-r" => opts.relay = iter.next().cloned(),
                "--mnemonic" | "-m" => opts.mnemonic = iter.next().cloned(),
                "--data-dir" | "-d" => opts.data_dir = iter.next().cloned(),
                _ if !arg.starts_with('-') => positional.push(arg.clone()),
                _ => {} // Ignore unknown flags
            }
        }

        let mut positional = positional.into_iter();
        opts.command = positional.next();
        opts.app = positional.next();

        // Environment has lower priority than flags
        if opts.mnemonic.is_none() {
            opts.mnemonic = env::var("HAZE_MNEMONIC").ok().filter(|s| !s.is_empty());
        }
        if opts.data_dir.is_none() {
            opts.data_dir = env::var("HAZE_DATA_DIR").ok().filter(|s| !s.is_empty());
        }
        opts
    }
}

/// Load `.env` from the working directory without overriding the environment.
fn load_dotenv() {
    let Ok(contents) = std::fs::read_to_string(".env") else { return };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"');
            if !value.is_empty() && env::var(key.trim()).is_err() {
                env::set_var(key.trim(), value);
            }
        }
    }
}

fn print_usage() {
    println!(
        r#"haze-nwc - Nostr Wallet Connect bridge tooling

USAGE:
    haze-nwc <command> [args] [options]

COMMANDS:
    pair <app>              Pair a client app, print its connection URI
    list                    List paired apps
    announce                Publish the wallet capability info event
    relays                  Show configured relays
    adverts                 Stream federation advertisements (Ctrl+C to stop)

OPTIONS:
    --mnemonic, -m <words>  Wallet mnemonic (env: HAZE_MNEMONIC)
    --relay, -r <url>       Relay for the pairing URI
    --data-dir, -d <path>   Data directory (env: HAZE_DATA_DIR)
    --pretty                Pretty-print JSON
    --version, -V           Print version

ENVIRONMENT:
    HAZE_RELAYS             Comma separated relay list
    HAZE_DEFAULT_RELAY      Relay embedded in pairings without --relay
    HAZE_LOG_JSON=1         JSON log lines on stderr

EXAMPLES:
    haze-nwc pair Alby --mnemonic "abandon ... about"
    haze-nwc announce
"#
    );
}

fn config(opts: &ParsedArgs) -> NwcConfig {
    let mut config = NwcConfig::from_env();
    if let Some(dir) = &opts.data_dir {
        config = config.with_data_dir(dir);
    }
    config
}

fn open_store(config: &NwcConfig) -> Result<Arc<dyn KvStore>, String> {
    let dir: PathBuf = config
        .data_dir
        .clone()
        .or_else(haze_nwc::store::default_data_dir)
        .ok_or("No data directory; pass --data-dir")?;
    debug!(dir = %dir.display(), "Opening store");
    let store = FileStore::open(&dir).map_err(|e| e.to_string())?;
    Ok(Arc::new(store))
}

fn identity(opts: &ParsedArgs) -> Result<ServiceIdentity, String> {
    let phrase = opts.mnemonic.as_deref().ok_or("Mnemonic required (--mnemonic or HAZE_MNEMONIC)")?;
    let words: Vec<&str> = phrase.split_whitespace().collect();
    ServiceIdentity::from_mnemonic(&words).map_err(|e| e.to_string())
}

fn cmd_pair(opts: &ParsedArgs) -> Result<Value, String> {
    let app = opts.app.as_deref().ok_or("Usage: haze-nwc pair <app> [--relay <url>]")?;
    let config = config(opts);
    let identity = identity(opts)?;
    let store = open_store(&config)?;

    let registry = ConnectionRegistry::load(store.clone(), config.default_relay.clone());
    let connection = registry
        .generate_connection(app, opts.relay.as_deref(), &identity.public_key())
        .map_err(|e| e.to_string())?;
    Settings::new(store).set_nwc_enabled(true).map_err(|e| e.to_string())?;
    info!(app = %connection.app_name, "Pairing created");

    Ok(json!({
        "app": connection.app_name,
        "client_pubkey": connection.client_pubkey.to_hex(),
        "wallet_pubkey": identity.pubkey_hex,
        "uri": connection.uri.to_string(),
    }))
}

fn cmd_list(opts: &ParsedArgs) -> Result<Value, String> {
    let config = config(opts);
    let registry = ConnectionRegistry::load(open_store(&config)?, config.default_relay.clone());
    let apps: Vec<Value> = registry
        .list()
        .into_iter()
        .map(|(app, pairing)| json!({ "app": app, "client_pubkey": pairing.client_pubkey, "relay": pairing.preferred_relay }))
        .collect();
    Ok(json!({ "pairings": apps, "count": apps.len() }))
}

fn cmd_relays(opts: &ParsedArgs) -> Result<Value, String> {
    let config = config(opts);
    let settings = Settings::new(open_store(&config)?);
    let relays = settings.relays(&config.relays).map_err(|e| e.to_string())?;
    Ok(json!({
        "relays": relays,
        "default_pairing_relay": config.default_relay,
        "nwc_enabled": settings.nwc_enabled().unwrap_or(false),
    }))
}

async fn connect_pool(config: &NwcConfig) -> Result<Arc<RelayPool>, String> {
    let relays = Settings::new(open_store(config)?)
        .relays(&config.relays)
        .map_err(|e| e.to_string())?;
    let pool = Arc::new(RelayPool::new(relays));
    pool.connect().await.map_err(|e| e.to_string())?;
    debug!("Relay pool connected");
    Ok(pool)
}

async fn cmd_announce(opts: &ParsedArgs) -> Result<Value, String> {
    let config = config(opts);
    let identity = identity(opts)?;
    let pool = connect_pool(&config).await?;

    let codec = EventCodec::new(identity.keys.clone());
    let event = codec
        .info_event(&advertised_capabilities(), Some(&config.alias))
        .map_err(|e| e.to_string())?;
    let relays = pool.publish(&event).await.map_err(|e| e.to_string())?;
    pool.shutdown().await;

    Ok(json!({
        "status": if relays > 0 { "published" } else { "failed" },
        "event_id": event.id.to_hex(),
        "wallet_pubkey": identity.pubkey_hex,
        "relays_count": relays,
    }))
}

async fn cmd_adverts(opts: &ParsedArgs) -> Result<Value, String> {
    let config = config(opts);
    let pool = connect_pool(&config).await?;
    let shutdown = install_signal_handlers();

    let mut subscription = pool
        .subscribe(EventFilter::kind(kinds::FEDERATION_ANNOUNCEMENT))
        .await
        .map_err(|e| e.to_string())?;
    let window = tokio::time::sleep(config.timeouts.discovery);
    tokio::pin!(window);

    let mut seen = std::collections::BTreeMap::new();
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = &mut window => break,
            notification = subscription.notifications.recv() => match notification {
                Some(RelayNotification::Event(event)) => {
                    let (Some(invite), Some(federation)) =
                        (first_tag_value(&event, INVITE_TAG), first_tag_value(&event, FEDERATION_TAG))
                    else {
                        continue;
                    };
                    if seen.insert(federation.to_string(), invite.to_string()).is_none() {
                        info!(federation, "Advertisement");
                    }
                }
                Some(_) => continue,
                None => break,
            }
        }
    }
    pool.unsubscribe(&subscription.id).await;
    pool.shutdown().await;

    let adverts: Vec<Value> = seen
        .into_iter()
        .map(|(federation, invite)| json!({ "federation_id": federation, "invite_code": invite }))
        .collect();
    Ok(json!({ "federations": adverts, "count": adverts.len() }))
}
