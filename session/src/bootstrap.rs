//! Bootstrap session: receive credentials pushed by the bootstrap server.
//!
//! The device opens the session, announces itself with `POST /bs`, and
//! then acts as a server: the bootstrap server writes object instances
//! under `/0`, `/1` and `/3` and finally posts `/bs` again to signal that
//! provisioning is complete. Every resource delivered is persisted under
//! its canonical path so the credential reload can pick it up.

use crate::device::Device;
use crate::transport::{self, CoapClient, InboundHandler, Router, TransportConfig};
use crate::SessionError;
use async_trait::async_trait;
use coap_lite::{MessageClass, Packet, RequestType, ResponseType};
use lwm2m_storage::{resource_path, Store};
use lwm2m_wire::{Tlv, TlvType, MEDIA_TYPE_TLV};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

/// CoAP content-format for `text/plain`.
const MEDIA_TYPE_TEXT: u16 = 0;

/// How long to wait for the server's finish signal after `POST /bs`.
const FINISH_TIMEOUT: Duration = Duration::from_secs(10);

impl Device {
    /// Run the bootstrap exchange against the bootstrap server.
    ///
    /// Opens a DTLS session with the bootstrap certificate, announces the
    /// device with `POST /bs`, serves the server's object writes, and
    /// waits for the finish signal under a fixed timeout. On finish the
    /// delivered credentials are reloaded from the store and validated.
    /// A message on `shutdown` cancels the session with
    /// [`SessionError::Cancelled`].
    pub async fn bootstrap(
        &mut self,
        shutdown: &mut mpsc::Receiver<()>,
    ) -> Result<(), SessionError> {
        let (bootstrap_id, host, certificate) = {
            let (id, url, cert) = self.bootstrap_credentials()?;
            (id.to_string(), url.host(), cert.clone())
        };

        let finished = Arc::new(Notify::new());
        let objects = Arc::new(ObjectWriteHandler {
            store: self.store.clone(),
        });
        let router = Router::new()
            .route("0", objects.clone())
            .route("1", objects.clone())
            .route("3", objects)
            .route(
                "bs",
                Arc::new(FinishHandler {
                    finished: finished.clone(),
                }),
            );

        let transport = TransportConfig {
            certificate,
            insecure_skip_verify: self.insecure_skip_verify,
        };
        let client = CoapClient::dial(&host, transport, router).await?;
        let result = self
            .run_bootstrap(&client, &bootstrap_id, finished, shutdown)
            .await;
        client.close().await;
        result
    }

    async fn run_bootstrap(
        &mut self,
        client: &CoapClient,
        bootstrap_id: &str,
        finished: Arc<Notify>,
        shutdown: &mut mpsc::Receiver<()>,
    ) -> Result<(), SessionError> {
        let queries = [
            format!("ep={}", bootstrap_id),
            format!("aid={}", self.account_id),
        ];
        let response = client
            .post("bs", &queries, Some(MEDIA_TYPE_TEXT), Vec::new())
            .await?;
        transport::expect_code(&response, ResponseType::Changed)?;
        info!("bootstrap request accepted, waiting for server writes");

        tokio::select! {
            _ = finished.notified() => {}
            _ = tokio::time::sleep(FINISH_TIMEOUT) => return Err(SessionError::Timeout),
            _ = shutdown.recv() => return Err(SessionError::Cancelled),
        }

        self.load_lwm2m_credentials_from_store().await
    }
}

/// Persists object instances the bootstrap server writes under an object
/// path.
struct ObjectWriteHandler {
    store: Arc<dyn Store>,
}

#[async_trait]
impl InboundHandler for ObjectWriteHandler {
    async fn handle(&self, request: &Packet) -> ResponseType {
        let path = transport::request_path(request);
        let object_id: u16 = match path.parse() {
            Ok(id) => id,
            Err(_) => {
                warn!("object write to non-numeric path /{}", path);
                return ResponseType::BadRequest;
            }
        };
        match request.header.code {
            MessageClass::Request(RequestType::Delete) => {
                // Nothing is cached for these objects before bootstrap;
                // acknowledge without touching the store.
                info!("DELETE /{}", object_id);
                ResponseType::Deleted
            }
            MessageClass::Request(RequestType::Put) => self.write_object(object_id, request).await,
            other => {
                warn!("method not allowed on /{}: {:?}", object_id, other);
                ResponseType::MethodNotAllowed
            }
        }
    }
}

impl ObjectWriteHandler {
    async fn write_object(&self, object_id: u16, request: &Packet) -> ResponseType {
        if transport::content_format(request) != Some(MEDIA_TYPE_TLV) {
            warn!(
                "PUT /{} with content-format {:?}",
                object_id,
                transport::content_format(request)
            );
            return ResponseType::UnsupportedContentFormat;
        }
        if request.payload.is_empty() {
            warn!("PUT /{} carried no body", object_id);
            return ResponseType::BadRequest;
        }
        let root = match Tlv::decode_one(&request.payload) {
            Ok((root, _)) => root,
            Err(e) => {
                warn!("PUT /{}: undecodable tlv: {}", object_id, e);
                return ResponseType::BadRequest;
            }
        };
        if root.tlv_type != TlvType::ObjectInstance {
            warn!(
                "PUT /{}: expected an object instance, got {}",
                object_id, root.tlv_type
            );
            return ResponseType::BadRequest;
        }

        info!(
            "PUT /{}: instance {} with {} entries",
            object_id,
            root.identifier,
            root.children.len()
        );
        for child in &root.children {
            if child.tlv_type != TlvType::Resource {
                debug!("skipping {} under /{}", child, object_id);
                continue;
            }
            let key = resource_path(object_id, root.identifier, child.identifier);
            if let Err(e) = self.store.put(&key, &child.value).await {
                warn!("storing {}: {}", key, e);
                return ResponseType::InternalServerError;
            }
        }
        ResponseType::Changed
    }
}

/// Latches the server's `POST /bs` finish signal; repeated posts are
/// harmless.
struct FinishHandler {
    finished: Arc<Notify>,
}

#[async_trait]
impl InboundHandler for FinishHandler {
    async fn handle(&self, _request: &Packet) -> ResponseType {
        info!("bootstrap complete");
        self.finished.notify_one();
        ResponseType::Changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coap_lite::CoapOption;
    use lwm2m_storage::MemoryStore;

    fn put_request(path: &str, content_format: Option<u16>, payload: Vec<u8>) -> Packet {
        let mut request = Packet::new();
        request.header.code = MessageClass::Request(RequestType::Put);
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            request.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
        }
        if let Some(code) = content_format {
            let raw = if code <= 0xFF {
                vec![code as u8]
            } else {
                code.to_be_bytes().to_vec()
            };
            request.add_option(CoapOption::ContentFormat, raw);
        }
        request.payload = payload;
        request
    }

    fn handler() -> (Arc<MemoryStore>, ObjectWriteHandler) {
        let store = Arc::new(MemoryStore::new());
        let handler = ObjectWriteHandler {
            store: store.clone(),
        };
        (store, handler)
    }

    #[tokio::test]
    async fn test_put_persists_resource_children() {
        let (store, handler) = handler();
        let body = Tlv::object_instance(
            0,
            vec![
                Tlv::resource(0, &b"coaps://lw.example:5684?aid=a"[..]),
                Tlv::resource(3, vec![0x30, 0x82]),
                Tlv::multi_resource(7, vec![Tlv::resource_instance(0, vec![0x01])]),
            ],
        )
        .encode()
        .to_vec();

        let code = handler
            .handle(&put_request("0", Some(MEDIA_TYPE_TLV), body))
            .await;
        assert_eq!(code, ResponseType::Changed);

        assert_eq!(
            store.get("/0/0/0").await.unwrap(),
            b"coaps://lw.example:5684?aid=a"
        );
        assert_eq!(store.get("/0/0/3").await.unwrap(), vec![0x30, 0x82]);
        // Non-Resource children are ignored.
        assert!(store.get("/0/0/7").await.is_err());
    }

    #[tokio::test]
    async fn test_put_uses_root_identifier_as_instance() {
        let (store, handler) = handler();
        let body = Tlv::object_instance(2, vec![Tlv::resource(1, &b"x"[..])])
            .encode()
            .to_vec();
        let code = handler
            .handle(&put_request("3", Some(MEDIA_TYPE_TLV), body))
            .await;
        assert_eq!(code, ResponseType::Changed);
        assert_eq!(store.get("/3/2/1").await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_put_rejects_wrong_content_format() {
        let (_store, handler) = handler();
        let body = Tlv::object_instance(0, vec![]).encode().to_vec();
        let code = handler.handle(&put_request("0", Some(42), body)).await;
        assert_eq!(code, ResponseType::UnsupportedContentFormat);
    }

    #[tokio::test]
    async fn test_put_rejects_missing_body() {
        let (_store, handler) = handler();
        let code = handler
            .handle(&put_request("0", Some(MEDIA_TYPE_TLV), Vec::new()))
            .await;
        assert_eq!(code, ResponseType::BadRequest);
    }

    #[tokio::test]
    async fn test_put_rejects_non_object_root() {
        let (_store, handler) = handler();
        let body = Tlv::resource(3, &b"1.0"[..]).encode().to_vec();
        let code = handler
            .handle(&put_request("0", Some(MEDIA_TYPE_TLV), body))
            .await;
        assert_eq!(code, ResponseType::BadRequest);
    }

    #[tokio::test]
    async fn test_non_numeric_path_is_bad_request() {
        let (_store, handler) = handler();
        let body = Tlv::object_instance(0, vec![]).encode().to_vec();
        let code = handler
            .handle(&put_request("abc", Some(MEDIA_TYPE_TLV), body))
            .await;
        assert_eq!(code, ResponseType::BadRequest);
    }

    #[tokio::test]
    async fn test_delete_acknowledged_without_store_writes() {
        let (store, handler) = handler();
        let mut request = Packet::new();
        request.header.code = MessageClass::Request(RequestType::Delete);
        request.add_option(CoapOption::UriPath, b"1".to_vec());
        assert_eq!(handler.handle(&request).await, ResponseType::Deleted);
        assert!(store.get("/1/0/0").await.is_err());
    }

    #[tokio::test]
    async fn test_other_methods_not_allowed() {
        let (_store, handler) = handler();
        let mut request = Packet::new();
        request.header.code = MessageClass::Request(RequestType::Get);
        request.add_option(CoapOption::UriPath, b"0".to_vec());
        assert_eq!(
            handler.handle(&request).await,
            ResponseType::MethodNotAllowed
        );
    }

    #[tokio::test]
    async fn test_finish_handler_latches_once() {
        let finished = Arc::new(Notify::new());
        let handler = FinishHandler {
            finished: finished.clone(),
        };
        let request = Packet::new();
        // A misbehaving server may repeat the finish post.
        assert_eq!(handler.handle(&request).await, ResponseType::Changed);
        assert_eq!(handler.handle(&request).await, ResponseType::Changed);
        // The latch is consumable exactly once per waiter.
        finished.notified().await;
    }
}
