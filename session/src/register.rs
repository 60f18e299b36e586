//! Registration exchange against the provisioned LWM2M server.
//!
//! Registration here is a reachability proof: the device registers its
//! object inventory, extracts the location the server assigned, and
//! immediately deregisters by deleting that location.

use crate::device::Device;
use crate::identity::CoapUrl;
use crate::transport::{expect_code, CoapClient, Router, TransportConfig};
use crate::SessionError;
use coap_lite::{CoapOption, Packet, ResponseType};
use tokio::sync::mpsc;
use tracing::info;

/// CoAP content-format for the CoRE Link Format.
const MEDIA_TYPE_LINK_FORMAT: u16 = 40;

/// Object inventory announced at registration.
const REGISTRATION_OBJECTS: &str = "</1>,</2>,</3>,</4>,</5>";

impl Device {
    /// Register against the LWM2M server, then immediately deregister.
    ///
    /// `POST /rd` must yield `2.01 Created` with a location; deleting
    /// that location must yield `2.02 Deleted`. A message on `shutdown`
    /// cancels the exchange with [`SessionError::Cancelled`].
    pub async fn register(
        &mut self,
        shutdown: &mut mpsc::Receiver<()>,
    ) -> Result<(), SessionError> {
        let (endpoint_name, url, certificate) = {
            let (name, url, cert) = self.register_credentials()?;
            (name.to_string(), url.clone(), cert.clone())
        };

        let transport = TransportConfig {
            certificate,
            insecure_skip_verify: self.insecure_skip_verify,
        };
        let client = CoapClient::dial(&url.host(), transport, Router::new()).await?;
        let result = tokio::select! {
            result = run_register(&client, &endpoint_name, &url) => result,
            _ = shutdown.recv() => Err(SessionError::Cancelled),
        };
        client.close().await;
        result
    }
}

async fn run_register(
    client: &CoapClient,
    endpoint_name: &str,
    url: &CoapUrl,
) -> Result<(), SessionError> {
    let mut queries = vec![format!("ep={}", endpoint_name)];
    for (key, value) in url.query_pairs() {
        queries.push(format!("{}={}", key, value));
    }

    let response = client
        .post(
            "rd",
            &queries,
            Some(MEDIA_TYPE_LINK_FORMAT),
            REGISTRATION_OBJECTS.as_bytes().to_vec(),
        )
        .await?;
    expect_code(&response, ResponseType::Created)?;
    let location = location_path(&response)?;
    info!("device registered at {}", location);

    let response = client.delete(&location).await?;
    expect_code(&response, ResponseType::Deleted)?;
    info!("device de-registered");
    Ok(())
}

/// Reassemble the registration resource location from the response's
/// `Location-Path` options.
fn location_path(response: &Packet) -> Result<String, SessionError> {
    let segments = response
        .get_option(CoapOption::LocationPath)
        .filter(|segments| !segments.is_empty())
        .ok_or_else(|| SessionError::Protocol("registration response carried no location".into()))?;
    let mut location = String::new();
    for segment in segments {
        location.push('/');
        location.push_str(&String::from_utf8_lossy(segment));
    }
    Ok(location)
}

#[cfg(test)]
mod tests {
    use super::*;
    use coap_lite::{MessageClass, ResponseType};

    #[test]
    fn test_location_path_reassembly() {
        let mut response = Packet::new();
        response.header.code = MessageClass::Response(ResponseType::Created);
        response.add_option(CoapOption::LocationPath, b"rd".to_vec());
        response.add_option(CoapOption::LocationPath, b"5a3f".to_vec());
        assert_eq!(location_path(&response).unwrap(), "/rd/5a3f");
    }

    #[test]
    fn test_location_path_missing_is_protocol_error() {
        let response = Packet::new();
        assert!(matches!(
            location_path(&response),
            Err(SessionError::Protocol(_))
        ));
    }
}
