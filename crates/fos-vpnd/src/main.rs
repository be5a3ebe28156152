//! fos-vpnd: VPN Connection Daemon
//!
//! Thin front end over `fos-vpn`. Initializes the global allocator and
//! logging, loads settings, and dispatches one of:
//!
//! ```text
//! fos-vpnd connect <profile.toml> [--key <file>]
//! fos-vpnd status
//! fos-vpnd disconnect
//! fos-vpnd keygen
//! ```

use anyhow::{Context, Result, anyhow, bail};
use fos_network::{NetworkConfigurator, is_elevated};
use fos_vpn::daemon::DaemonPhase;
use fos_vpn::ipc::{CMD_DISCONNECT, CMD_STATUS};
use fos_vpn::{
    ConnectionState, Daemon, ExternalEngine, IpcError, KeyPair, OpenVpnTunnel, PrivateKey, Protocol,
    ServerProfile, Settings, Tunnel, WireGuardTunnel, logging, send_request,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Environment variable holding a base64 WireGuard private key
const ENV_PRIVATE_KEY: &str = "FOS_VPN_PRIVATE_KEY";

const USAGE: &str = "usage: fos-vpnd <connect <profile.toml> [--key <file>] | status | disconnect | keygen>";

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("failed to load settings")?;
    logging::init(&settings.log_level);
    debug!("Using mimalloc allocator");

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("connect") => connect(&settings, &args[1..]).await,
        Some("status") => status(&settings).await,
        Some("disconnect") => disconnect(&settings).await,
        Some("keygen") => {
            keygen();
            Ok(())
        }
        _ => bail!(USAGE),
    }
}

async fn connect(settings: &Settings, args: &[String]) -> Result<()> {
    let (profile_path, key_path) = match args {
        [profile] => (PathBuf::from(profile), None),
        [profile, flag, key] if flag == "--key" => (PathBuf::from(profile), Some(PathBuf::from(key))),
        _ => bail!(USAGE),
    };

    if !is_elevated() {
        bail!("administrator/root privileges are required to configure the network");
    }

    let store = settings.state_store();
    if let Some(existing) = store.active()? {
        bail!("already connected to {} (run `fos-vpnd disconnect` first)", existing.server);
    }

    let profile = ServerProfile::load(&profile_path)
        .with_context(|| format!("failed to load profile {}", profile_path.display()))?;

    let tunnel: Arc<dyn Tunnel> = match profile.protocol {
        Protocol::WireGuard => {
            let key = private_key(key_path)?;
            let engine = ExternalEngine::detect(settings.wireguard_engine.as_deref())?;
            info!("Using WireGuard engine {}", engine.program().display());
            Arc::new(WireGuardTunnel::new(
                profile.clone(),
                &key.to_base64(),
                &settings.interface_name,
                Box::new(engine),
            ))
        }
        Protocol::OpenVpn => Arc::new(OpenVpnTunnel::new(profile.clone(), settings.openvpn_options())),
    };

    let mut daemon = Daemon::new(profile.clone(), tunnel, NetworkConfigurator::system(), store)
        .with_ipc(settings.ipc_endpoint());

    let mut phases = daemon.subscribe();
    let name = profile.name.clone();
    let progress = tokio::spawn(async move {
        eprintln!("Connecting to {}...", name);
        logging::pause();
        let phase = phases
            .wait_for(|p| *p == DaemonPhase::Connected || p.is_final())
            .await
            .map(|p| *p);
        logging::resume();
        if let Ok(DaemonPhase::Connected) = phase {
            eprintln!("Connected to {}. Press Ctrl-C to disconnect.", name);
        }
    });

    let result = daemon.run(CancellationToken::new()).await;
    progress.abort();
    logging::resume();
    result.with_context(|| format!("connection to {} failed", profile.name))
}

/// Private key from `--key <file>` or the environment
fn private_key(path: Option<PathBuf>) -> Result<PrivateKey> {
    let encoded = match path {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read key file {}", path.display()))?,
        None => std::env::var(ENV_PRIVATE_KEY)
            .map_err(|_| anyhow!("no private key: pass --key <file> or set {}", ENV_PRIVATE_KEY))?,
    };
    PrivateKey::from_base64(encoded.trim()).context("invalid private key")
}

async fn status(settings: &Settings) -> Result<()> {
    match send_request(&settings.ipc_endpoint(), CMD_STATUS).await {
        Ok(response) => match response.state {
            Some(state) if response.success => print_state(&state, true),
            _ => println!("Not connected"),
        },
        Err(IpcError::NotRunning) => match settings.state_store().active()? {
            Some(state) => print_state(&state, false),
            None => println!("Not connected"),
        },
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn print_state(state: &ConnectionState, live: bool) {
    println!("Connected to {} ({})", state.server, state.protocol);
    println!("  Endpoint:  {}", state.endpoint);
    println!("  Interface: {}", state.interface_name);
    println!("  Address:   {}", state.tunnel_ip);
    println!("  Uptime:    {}", state.uptime());
    if live {
        println!(
            "  Traffic:   TX {:.2}MB, RX {:.2}MB",
            state.tx_bytes as f64 / (1024.0 * 1024.0),
            state.rx_bytes as f64 / (1024.0 * 1024.0)
        );
    } else {
        println!("  (daemon not reachable; showing saved state)");
    }
}

async fn disconnect(settings: &Settings) -> Result<()> {
    match send_request(&settings.ipc_endpoint(), CMD_DISCONNECT).await {
        Ok(response) if response.success => println!("Disconnecting..."),
        Ok(response) => bail!(
            "disconnect failed: {}",
            response.error.unwrap_or_else(|| "unknown error".to_string())
        ),
        Err(IpcError::NotRunning) => {
            settings.state_store().clear()?;
            println!("VPN is not running");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn keygen() {
    let pair = KeyPair::generate();
    println!("Private key: {}", pair.private.to_base64());
    println!("Public key:  {}", pair.public.to_base64());
}
