//! CoAP URL and device certificate handling.
//!
//! Both sessions are configured by a `coaps://host:port?aid=<account>` URL
//! and a client certificate whose subject CN names the device: the
//! bootstrap id for factory credentials, the endpoint name for
//! operational credentials.

use crate::SessionError;
use std::fmt;
use std::path::Path;
use url::Url;
use webrtc_dtls::crypto::Certificate;
use x509_parser::prelude::*;

/// Default CoAP-over-DTLS port, used when the URL does not name one.
const DEFAULT_COAPS_PORT: u16 = 5684;

/// A validated `coaps://` URL carrying the account id.
#[derive(Debug, Clone)]
pub struct CoapUrl {
    url: Url,
    account_id: String,
}

impl CoapUrl {
    /// Parse and validate a CoAP URL.
    ///
    /// The scheme must be `coaps` and the query must carry exactly one
    /// `aid` parameter naming the account.
    pub fn parse(raw: &str) -> Result<Self, SessionError> {
        let url = Url::parse(raw)
            .map_err(|e| SessionError::Config(format!("invalid url {:?}: {}", raw, e)))?;
        if url.scheme() != "coaps" {
            return Err(SessionError::Config(format!(
                "url scheme {:?} not supported, must be \"coaps\"",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(SessionError::Config(format!("url {:?} has no host", raw)));
        }
        let accounts: Vec<String> = url
            .query_pairs()
            .filter(|(key, _)| key == "aid")
            .map(|(_, value)| value.into_owned())
            .collect();
        let account_id = match accounts.as_slice() {
            [] => {
                return Err(SessionError::Config(
                    "url is missing the account query parameter \"aid\"".into(),
                ))
            }
            [account] => account.clone(),
            _ => {
                return Err(SessionError::Config(
                    "url must have exactly one account query parameter \"aid\"".into(),
                ))
            }
        };
        Ok(Self { url, account_id })
    }

    /// Account id from the `aid` query parameter.
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// `host:port` authority to dial.
    pub fn host(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        let port = self.url.port().unwrap_or(DEFAULT_COAPS_PORT);
        format!("{}:{}", host, port)
    }

    /// All query parameters in order, replayed as `Uri-Query` options
    /// during registration.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.url
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect()
    }

    /// The URL as given.
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

impl fmt::Display for CoapUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// A client certificate pair plus the identity its subject CN carries.
#[derive(Clone)]
pub struct Identity {
    /// DTLS client certificate with its private key
    pub certificate: Certificate,
    /// Subject common name of the leaf certificate
    pub common_name: String,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("common_name", &self.common_name)
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Load a PEM certificate and PKCS#8 private key pair from disk.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, SessionError> {
        let cert_pem = std::fs::read_to_string(cert_path).map_err(|e| {
            SessionError::Credential(format!("reading certificate {:?}: {}", cert_path, e))
        })?;
        let key_pem = std::fs::read_to_string(key_path).map_err(|e| {
            SessionError::Credential(format!("reading private key {:?}: {}", key_path, e))
        })?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Build an identity from PEM-encoded certificate and key text.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, SessionError> {
        let bundle = format!("{}\n{}", key_pem.trim_end(), cert_pem.trim_start());
        let certificate = Certificate::from_pem(&bundle)
            .map_err(|e| SessionError::Credential(format!("loading certificate pair: {}", e)))?;
        let leaf = certificate
            .certificate
            .first()
            .ok_or_else(|| SessionError::Credential("no certificate data present".into()))?;
        let common_name = cn_from_der(leaf.as_ref())?;
        Ok(Self {
            certificate,
            common_name,
        })
    }

    /// Build an identity from DER blobs, as delivered by the bootstrap
    /// server: an X.509 certificate and a PKCS#8 private key.
    pub fn from_der(cert_der: &[u8], key_der: &[u8]) -> Result<Self, SessionError> {
        let cert_pem = ::pem::encode(&::pem::Pem::new("CERTIFICATE", cert_der));
        let key_pem = ::pem::encode(&::pem::Pem::new("PRIVATE KEY", key_der));
        Self::from_pem(&cert_pem, &key_pem)
    }
}

/// Subject common name of a DER-encoded X.509 certificate.
pub fn cn_from_der(der: &[u8]) -> Result<String, SessionError> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| SessionError::Credential(format!("parsing certificate: {}", e)))?;
    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| SessionError::Credential("certificate subject has no common name".into()))?;
    Ok(common_name.to_string())
}
