//! Device state for bootstrap and registration.
//!
//! A device is identified by the account id carried in its server URL and
//! by the subject CN of its client certificate: the bootstrap id for
//! factory credentials, the endpoint name for operational credentials.
//! Bootstrap populates the operational side from the resource store.

use crate::identity::{CoapUrl, Identity};
use crate::SessionError;
use lwm2m_storage::{Store, RESOURCE_DEVICE_CERT, RESOURCE_DEVICE_KEY, RESOURCE_LWM2M_URL};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use webrtc_dtls::crypto::Certificate;

/// An LWM2M device: account identity, credentials for each server role,
/// and the resource store bootstrap writes into.
pub struct Device {
    pub(crate) account_id: String,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) insecure_skip_verify: bool,

    // Bootstrap server credentials
    pub(crate) bootstrap_id: Option<String>,
    pub(crate) bootstrap_url: Option<CoapUrl>,
    pub(crate) bootstrap_cert: Option<Certificate>,

    // LWM2M server credentials
    pub(crate) endpoint_name: Option<String>,
    pub(crate) lwm2m_url: Option<CoapUrl>,
    pub(crate) lwm2m_cert: Option<Certificate>,
}

impl Device {
    /// Initialize a device from factory bootstrap credentials.
    ///
    /// The certificate CN becomes the bootstrap id and the URL's `aid`
    /// query the account id.
    pub fn from_bootstrap_credentials(
        store: Arc<dyn Store>,
        url: &str,
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<Self, SessionError> {
        let identity = Identity::load(cert_path, key_path)?;
        let url = CoapUrl::parse(url)?;
        Ok(Self {
            account_id: url.account_id().to_string(),
            store,
            insecure_skip_verify: true,
            bootstrap_id: Some(identity.common_name),
            bootstrap_url: Some(url),
            bootstrap_cert: Some(identity.certificate),
            endpoint_name: None,
            lwm2m_url: None,
            lwm2m_cert: None,
        })
    }

    /// Initialize a device from operational LWM2M credentials.
    ///
    /// The certificate CN becomes the endpoint name.
    pub fn from_lwm2m_credentials(
        store: Arc<dyn Store>,
        url: &str,
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<Self, SessionError> {
        let identity = Identity::load(cert_path, key_path)?;
        let url = CoapUrl::parse(url)?;
        Ok(Self {
            account_id: url.account_id().to_string(),
            store,
            insecure_skip_verify: true,
            bootstrap_id: None,
            bootstrap_url: None,
            bootstrap_cert: None,
            endpoint_name: Some(identity.common_name),
            lwm2m_url: Some(url),
            lwm2m_cert: Some(identity.certificate),
        })
    }

    /// Account id the device belongs to.
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Endpoint name, once known.
    pub fn endpoint_name(&self) -> Option<&str> {
        self.endpoint_name.as_deref()
    }

    /// The resource store bootstrap writes into.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Enable verification of the server certificate during the DTLS
    /// handshake.
    ///
    /// The deployed platform attests server identity out of band, so
    /// verification is skipped by default.
    pub fn verify_peer(&mut self, verify: bool) {
        self.insecure_skip_verify = !verify;
    }

    pub(crate) fn bootstrap_credentials(
        &self,
    ) -> Result<(&str, &CoapUrl, &Certificate), SessionError> {
        let id = self
            .bootstrap_id
            .as_deref()
            .ok_or(SessionError::NotReady("bootstrap id"))?;
        let url = self
            .bootstrap_url
            .as_ref()
            .ok_or(SessionError::NotReady("bootstrap url"))?;
        let cert = self
            .bootstrap_cert
            .as_ref()
            .ok_or(SessionError::NotReady("bootstrap certificate"))?;
        Ok((id, url, cert))
    }

    pub(crate) fn register_credentials(
        &self,
    ) -> Result<(&str, &CoapUrl, &Certificate), SessionError> {
        let name = self
            .endpoint_name
            .as_deref()
            .ok_or(SessionError::NotReady("endpoint name"))?;
        let url = self
            .lwm2m_url
            .as_ref()
            .ok_or(SessionError::NotReady("lwm2m url"))?;
        let cert = self
            .lwm2m_cert
            .as_ref()
            .ok_or(SessionError::NotReady("lwm2m certificate"))?;
        Ok((name, url, cert))
    }

    /// Check that every bootstrap credential is present.
    pub fn ready_for_bootstrap(&self) -> Result<(), SessionError> {
        self.bootstrap_credentials().map(|_| ())
    }

    /// Check that every LWM2M credential is present.
    pub fn ready_for_register(&self) -> Result<(), SessionError> {
        self.register_credentials().map(|_| ())
    }

    /// Load and validate the LWM2M credentials the bootstrap server wrote
    /// to the store, then populate the device's operational fields.
    pub(crate) async fn load_lwm2m_credentials_from_store(&mut self) -> Result<(), SessionError> {
        let raw = self.store.get(RESOURCE_LWM2M_URL).await?;
        let raw = String::from_utf8(raw)
            .map_err(|_| SessionError::Credential("lwm2m url is not valid utf-8".into()))?;
        let lwm2m_url = CoapUrl::parse(&raw)?;
        if lwm2m_url.account_id() != self.account_id {
            warn!(
                "account mismatch, {} != {}",
                lwm2m_url.account_id(),
                self.account_id
            );
        }

        let cert_der = self.store.get(RESOURCE_DEVICE_CERT).await?;
        let key_der = self.store.get(RESOURCE_DEVICE_KEY).await?;
        let identity = Identity::from_der(&cert_der, &key_der)?;

        if let Some(previous) = &self.endpoint_name {
            if *previous != identity.common_name {
                warn!(
                    "endpoint name changed from {:?} to {:?}",
                    previous, identity.common_name
                );
            }
        }
        info!(
            "provisioned endpoint {:?} at {}",
            identity.common_name, lwm2m_url
        );
        self.endpoint_name = Some(identity.common_name);
        self.lwm2m_url = Some(lwm2m_url);
        self.lwm2m_cert = Some(identity.certificate);

        self.ready_for_register()
    }
}
