use std::io::{self, ErrorKind};
use std::sync::Arc;

use log::{error, info, warn};

use crate::config::config::Config;
use crate::config::profile::Profile;
use crate::core::inbound::Inbound;
use crate::core::router::DefaultRouter;
use crate::inbound::mixed::MixedInbound;
use crate::inbound::tun::TunInbound;
use crate::transport::masque::config::MasqueSettings;
use crate::transport::masque::MasqueTransport;

pub mod config;
pub mod core;
pub mod inbound;
pub mod stack;
pub mod transport;
pub mod util;
pub mod version;

/// Parses the run configuration, builds a runtime and drives the service
/// until SIGINT or SIGTERM. Startup errors are fatal; errors on individual
/// connections or tunnels never reach this level.
pub fn start(config_json: &str) -> io::Result<()> {
    let config = Config::parse(config_json)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

pub async fn run(config: Config) -> io::Result<()> {
    let profile = Arc::new(Profile::load(config.profile_path())?);
    let router = Arc::new(DefaultRouter::new(config.routing.clone()));

    for transport_config in &config.transports {
        match transport_config.kind.as_str() {
            "masque" => {
                let settings: MasqueSettings = match &transport_config.options {
                    Some(options) => serde_json::from_str(options.get()).map_err(|err| {
                        io::Error::new(
                            ErrorKind::InvalidData,
                            format!(
                                "masque transport '{}' options: {}",
                                transport_config.tag, err
                            ),
                        )
                    })?,
                    None => MasqueSettings::default(),
                };
                let transport =
                    MasqueTransport::new(&transport_config.tag, settings, profile.clone())?;
                router.register_transport(Arc::new(transport));
            }
            other => {
                warn!("unknown transport type '{}', skipping", other);
            }
        }
    }

    let mut inbounds: Vec<Arc<dyn Inbound>> = Vec::new();
    for inbound_config in &config.inbounds {
        let inbound: Arc<dyn Inbound> = match inbound_config.kind.as_str() {
            "tun" => {
                let settings = match &inbound_config.options {
                    Some(options) => serde_json::from_str(options.get()).map_err(|err| {
                        io::Error::new(
                            ErrorKind::InvalidData,
                            format!("tun inbound '{}' options: {}", inbound_config.tag, err),
                        )
                    })?,
                    None => Default::default(),
                };
                Arc::new(TunInbound::new(
                    &inbound_config.tag,
                    settings,
                    router.clone(),
                    profile.clone(),
                ))
            }
            "mixed" => {
                let settings = match &inbound_config.options {
                    Some(options) => serde_json::from_str(options.get()).map_err(|err| {
                        io::Error::new(
                            ErrorKind::InvalidData,
                            format!("mixed inbound '{}' options: {}", inbound_config.tag, err),
                        )
                    })?,
                    None => Default::default(),
                };
                Arc::new(MixedInbound::new(
                    &inbound_config.tag,
                    settings,
                    router.clone(),
                ))
            }
            other => {
                warn!("unknown inbound type '{}', skipping", other);
                continue;
            }
        };
        inbounds.push(inbound);
    }

    // Declaration order doubles as dependency order: a tun inbound listed
    // first has published its dialer before any mixed inbound accepts.
    for (index, inbound) in inbounds.iter().enumerate() {
        if let Err(err) = inbound.start().await {
            error!("failed to start inbound '{}': {}", inbound.tag(), err);
            for started in &inbounds[..index] {
                let _ = started.close().await;
            }
            return Err(err);
        }
    }
    info!("started, {} inbounds running", inbounds.len());

    wait_for_shutdown().await;

    info!("shutting down");
    for inbound in &inbounds {
        if let Err(err) = inbound.close().await {
            warn!("error closing inbound '{}': {}", inbound.tag(), err);
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            warn!("cannot install SIGTERM handler: {}", err);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
