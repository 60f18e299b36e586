//! LWM2M provisioning binary.
//!
//! Bootstraps a device against a bootstrap server over CoAP/DTLS, persists
//! the delivered credentials, and proves them with a registration
//! round-trip against the LWM2M server.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use lwm2m_session::Device;
use lwm2m_storage::StoreMode;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod report;

/// Which exchange the supplied credentials drive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Bootstrap against the bootstrap server, then register
    Bootstrap,
    /// Register directly against the LWM2M server
    Lwm2m,
}

/// Storage backend for provisioned resources.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    /// In-memory map, dropped on exit
    Memory,
    /// One file per resource under --store-filesystem-dir
    Filesystem,
}

/// LWM2M bootstrap and registration client
#[derive(Parser, Debug)]
#[command(
    name = "lwm2m-bootstrapper",
    version,
    about = "LWM2M device provisioning over CoAP/DTLS"
)]
struct Args {
    /// Bootstrap or LWM2M server URL, e.g. coaps://host:5684?aid=account
    #[arg(long)]
    coap_url: String,

    /// Path to the device certificate (PEM)
    #[arg(long)]
    coap_cert: PathBuf,

    /// Path to the device private key (PKCS#8 PEM)
    #[arg(long)]
    coap_key: PathBuf,

    /// Connect mode
    #[arg(long, value_enum)]
    mode: Mode,

    /// Storage backend
    #[arg(long, value_enum, default_value_t = StoreKind::Memory)]
    store: StoreKind,

    /// Directory for the filesystem store
    #[arg(long, default_value = "store")]
    store_filesystem_dir: PathBuf,

    /// Write the retrieved device certificate here as PEM
    #[arg(long)]
    dump_cert: Option<PathBuf>,

    /// Write the retrieved device private key here as PEM
    #[arg(long)]
    dump_key: Option<PathBuf>,

    /// Verify the server certificate during the DTLS handshake (the
    /// deployed platform attests server identity out of band)
    #[arg(long)]
    verify_peer: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::try_parse().unwrap_or_else(|e| {
        let _ = e.print();
        std::process::exit(1);
    });

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("lwm2m_bootstrapper={}", args.log_level).parse()?)
        .add_directive(format!("lwm2m_session={}", args.log_level).parse()?)
        .add_directive(format!("lwm2m_storage={}", args.log_level).parse()?)
        .add_directive(format!("lwm2m_wire={}", args.log_level).parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let store = lwm2m_storage::open(match args.store {
        StoreKind::Memory => StoreMode::Memory,
        StoreKind::Filesystem => StoreMode::Filesystem {
            dir: args.store_filesystem_dir.clone(),
        },
    });

    // Cancel in-flight sessions on Ctrl-C.
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            let _ = shutdown_tx.send(()).await;
        }
    });

    let mut device = match args.mode {
        Mode::Bootstrap => {
            let mut device = Device::from_bootstrap_credentials(
                store.clone(),
                &args.coap_url,
                &args.coap_cert,
                &args.coap_key,
            )
            .context("failed to set up device")?;
            device.verify_peer(args.verify_peer);
            device
                .bootstrap(&mut shutdown_rx)
                .await
                .context("failed to bootstrap")?;
            device
        }
        Mode::Lwm2m => {
            let mut device = Device::from_lwm2m_credentials(
                store.clone(),
                &args.coap_url,
                &args.coap_cert,
                &args.coap_key,
            )
            .context("failed to set up device")?;
            device.verify_peer(args.verify_peer);
            device
        }
    };

    device
        .register(&mut shutdown_rx)
        .await
        .context("failed to register")?;

    report::print_provisioned_resources(store.as_ref()).await;

    if args.dump_cert.is_some() || args.dump_key.is_some() {
        report::dump_credentials(
            store.as_ref(),
            args.dump_cert.as_deref(),
            args.dump_key.as_deref(),
        )
        .await
        .context("failed to export credentials")?;
    }

    Ok(())
}
