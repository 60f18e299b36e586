//! Post-run reporting: provisioned resource summary and PEM export.

use anyhow::Context;
use lwm2m_session::Identity;
use lwm2m_storage::{
    Store, RESOURCE_DEVICE_CERT, RESOURCE_DEVICE_KEY, RESOURCE_LWM2M_URL, RESOURCE_SERVER_KEY,
};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use tracing::{info, warn};

/// Log the resources the bootstrap exchange delivered.
pub async fn print_provisioned_resources(store: &dyn Store) {
    let resources = [
        (RESOURCE_LWM2M_URL, "LWM2M URL", true),
        (RESOURCE_DEVICE_CERT, "Device Certificate", false),
        (RESOURCE_SERVER_KEY, "LWM2M Public Key", false),
        (RESOURCE_DEVICE_KEY, "Device Private Key", false),
    ];
    for (path, description, printable) in resources {
        match store.get(path).await {
            Ok(value) if printable => {
                info!("{} - {}: {}", path, description, String::from_utf8_lossy(&value))
            }
            Ok(value) => info!("{} - {} ({} bytes)", path, description, value.len()),
            Err(_) => warn!("missing resource: {} - {}", path, description),
        }
    }
}

/// Export the provisioned certificate and key as PEM files.
///
/// Both store blobs are re-validated as a usable certificate pair before
/// anything is written.
pub async fn dump_credentials(
    store: &dyn Store,
    cert_out: Option<&Path>,
    key_out: Option<&Path>,
) -> anyhow::Result<()> {
    let cert_der = store
        .get(RESOURCE_DEVICE_CERT)
        .await
        .with_context(|| format!("could not get {}", RESOURCE_DEVICE_CERT))?;
    let key_der = store
        .get(RESOURCE_DEVICE_KEY)
        .await
        .with_context(|| format!("could not get {}", RESOURCE_DEVICE_KEY))?;
    Identity::from_der(&cert_der, &key_der)
        .context("provisioned credentials failed validation")?;

    if let Some(path) = cert_out {
        write_pem(path, "CERTIFICATE", cert_der)?;
        info!("wrote certificate to {:?}", path);
    }
    if let Some(path) = key_out {
        write_pem(path, "PRIVATE KEY", key_der)?;
        info!("wrote private key to {:?}", path);
    }
    Ok(())
}

fn write_pem(path: &Path, tag: &str, der: Vec<u8>) -> anyhow::Result<()> {
    let encoded = pem::encode(&pem::Pem::new(tag, der));
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("opening {:?}", path))?;
    file.write_all(encoded.as_bytes())?;
    Ok(())
}
