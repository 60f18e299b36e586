//! End-to-end bootstrap and registration against a mock server.
//!
//! The mock side runs a real DTLS listener (client certificate required,
//! extended master secret required) and speaks just enough CoAP to drive
//! the device through both exchanges.

use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType, ResponseType};
use lwm2m_session::{Device, SessionError};
use lwm2m_storage::{MemoryStore, Store};
use lwm2m_wire::{Tlv, MEDIA_TYPE_TLV};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc_dtls::config::{ClientAuthType, Config, ExtendedMasterSecretType};
use webrtc_dtls::crypto::Certificate;
use webrtc_dtls::listener::listen;
use webrtc_util::conn::{Conn, Listener};

/// A freshly minted identity: PEM text plus the raw DER blobs.
struct TestIdentity {
    cert_pem: String,
    key_pem: String,
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
}

fn generate_identity(common_name: &str) -> TestIdentity {
    let mut params = rcgen::CertificateParams::new(Vec::<String>::new());
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, common_name);
    let cert = rcgen::Certificate::from_params(params).unwrap();
    TestIdentity {
        cert_pem: cert.serialize_pem().unwrap(),
        key_pem: cert.serialize_private_key_pem(),
        cert_der: cert.serialize_der().unwrap(),
        key_der: cert.serialize_private_key_der(),
    }
}

fn write_credentials(identity: &TestIdentity) -> (tempfile::TempDir, PathBuf, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("device.crt");
    let key_path = dir.path().join("device.key");
    std::fs::write(&cert_path, &identity.cert_pem).unwrap();
    std::fs::write(&key_path, &identity.key_pem).unwrap();
    (dir, cert_path, key_path)
}

fn server_config(identity: &TestIdentity) -> Config {
    let certificate =
        Certificate::from_pem(&format!("{}\n{}", identity.key_pem, identity.cert_pem)).unwrap();
    Config {
        certificates: vec![certificate],
        client_auth: ClientAuthType::RequireAnyClientCert,
        extended_master_secret: ExtendedMasterSecretType::Require,
        ..Default::default()
    }
}

type ServerConn = Arc<dyn Conn + Send + Sync>;

async fn recv_request(conn: &ServerConn) -> Packet {
    let mut buffer = vec![0u8; 16384];
    loop {
        let len = conn.recv(&mut buffer).await.unwrap();
        let packet = Packet::from_bytes(&buffer[..len]).unwrap();
        if matches!(packet.header.code, MessageClass::Request(_)) {
            return packet;
        }
    }
}

async fn recv_response(conn: &ServerConn) -> Packet {
    let mut buffer = vec![0u8; 16384];
    loop {
        let len = conn.recv(&mut buffer).await.unwrap();
        let packet = Packet::from_bytes(&buffer[..len]).unwrap();
        if matches!(packet.header.code, MessageClass::Response(_)) {
            return packet;
        }
    }
}

async fn send_response(conn: &ServerConn, request: &Packet, code: ResponseType, location: &[&str]) {
    let mut response = Packet::new();
    response.header.set_type(MessageType::Acknowledgement);
    response.header.message_id = request.header.message_id;
    response.header.code = MessageClass::Response(code);
    response.set_token(request.get_token().to_vec());
    for segment in location {
        response.add_option(CoapOption::LocationPath, segment.as_bytes().to_vec());
    }
    conn.send(&response.to_bytes().unwrap()).await.unwrap();
}

async fn send_request(
    conn: &ServerConn,
    method: RequestType,
    path_segments: &[&str],
    message_id: u16,
    token: u8,
    content_format: Option<u16>,
    payload: Vec<u8>,
) {
    let mut request = Packet::new();
    request.header.set_type(MessageType::Confirmable);
    request.header.message_id = message_id;
    request.header.code = MessageClass::Request(method);
    request.set_token(vec![token]);
    for segment in path_segments {
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
    conn.send(&request.to_bytes().unwrap()).await.unwrap();
}

fn query_values(request: &Packet) -> Vec<String> {
    request
        .get_option(CoapOption::UriQuery)
        .map(|values| {
            values
                .iter()
                .map(|value| String::from_utf8_lossy(value).into_owned())
                .collect()
        })
        .unwrap_or_default()
}

fn path_segments(request: &Packet) -> Vec<String> {
    request
        .get_option(CoapOption::UriPath)
        .map(|segments| {
            segments
                .iter()
                .map(|segment| String::from_utf8_lossy(segment).into_owned())
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_provisions_device_from_mock_server() {
    let device_identity = generate_identity("bootstrap-device");
    let server_identity = generate_identity("bootstrap-server");
    let provisioned = generate_identity("endpoint-01");

    let listener = listen("127.0.0.1:0", server_config(&server_identity))
        .await
        .unwrap();
    let addr = listener.addr().await.unwrap();

    let lwm2m_url = "coaps://lw.example:5684?aid=acct-42".to_string();
    let push_url = lwm2m_url.clone();
    let push_cert = provisioned.cert_der.clone();
    let push_key = provisioned.key_der.clone();

    let server = tokio::spawn(async move {
        let (conn, _remote) = listener.accept().await.unwrap();

        // The device announces itself.
        let request = recv_request(&conn).await;
        assert_eq!(
            request.header.code,
            MessageClass::Request(RequestType::Post)
        );
        assert_eq!(path_segments(&request), vec!["bs"]);
        let queries = query_values(&request);
        assert!(queries.contains(&"ep=bootstrap-device".to_string()), "{:?}", queries);
        assert!(queries.contains(&"aid=acct-42".to_string()), "{:?}", queries);
        send_response(&conn, &request, ResponseType::Changed, &[]).await;

        // Push the security object instance with URL, certificate and key.
        let body = Tlv::object_instance(
            0,
            vec![
                Tlv::resource(0, push_url.into_bytes()),
                Tlv::resource(3, push_cert),
                Tlv::resource(5, push_key),
            ],
        )
        .encode()
        .to_vec();
        send_request(
            &conn,
            RequestType::Put,
            &["0"],
            0x1000,
            0xAA,
            Some(MEDIA_TYPE_TLV),
            body,
        )
        .await;
        let ack = recv_response(&conn).await;
        assert_eq!(
            ack.header.code,
            MessageClass::Response(ResponseType::Changed)
        );

        // Finish signal.
        send_request(&conn, RequestType::Post, &["bs"], 0x1001, 0xAB, None, Vec::new()).await;
        let ack = recv_response(&conn).await;
        assert_eq!(
            ack.header.code,
            MessageClass::Response(ResponseType::Changed)
        );
    });

    let (_dir, cert_path, key_path) = write_credentials(&device_identity);
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let url = format!("coaps://{}?aid=acct-42", addr);
    let mut device =
        Device::from_bootstrap_credentials(store.clone(), &url, &cert_path, &key_path).unwrap();

    let (_shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    device.bootstrap(&mut shutdown_rx).await.unwrap();
    server.await.unwrap();

    assert_eq!(store.get("/0/0/0").await.unwrap(), lwm2m_url.as_bytes());
    assert_eq!(store.get("/0/0/3").await.unwrap(), provisioned.cert_der);
    assert_eq!(store.get("/0/0/5").await.unwrap(), provisioned.key_der);
    assert!(device.ready_for_register().is_ok());
    assert_eq!(device.endpoint_name(), Some("endpoint-01"));
}

#[tokio::test(flavor = "multi_thread")]
async fn register_round_trips_against_mock_server() {
    let device_identity = generate_identity("endpoint-99");
    let server_identity = generate_identity("lwm2m-server");

    let listener = listen("127.0.0.1:0", server_config(&server_identity))
        .await
        .unwrap();
    let addr = listener.addr().await.unwrap();

    let server = tokio::spawn(async move {
        let (conn, _remote) = listener.accept().await.unwrap();

        let request = recv_request(&conn).await;
        assert_eq!(
            request.header.code,
            MessageClass::Request(RequestType::Post)
        );
        assert_eq!(path_segments(&request), vec!["rd"]);
        assert_eq!(request.payload, b"</1>,</2>,</3>,</4>,</5>".to_vec());
        // The endpoint query leads, then the URL's queries in order.
        assert_eq!(
            query_values(&request),
            vec!["ep=endpoint-99".to_string(), "aid=acct-7".to_string()]
        );
        send_response(&conn, &request, ResponseType::Created, &["rd", "5a3f"]).await;

        let request = recv_request(&conn).await;
        assert_eq!(
            request.header.code,
            MessageClass::Request(RequestType::Delete)
        );
        assert_eq!(path_segments(&request), vec!["rd", "5a3f"]);
        send_response(&conn, &request, ResponseType::Deleted, &[]).await;
    });

    let (_dir, cert_path, key_path) = write_credentials(&device_identity);
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let url = format!("coaps://{}?aid=acct-7", addr);
    let mut device = Device::from_lwm2m_credentials(store, &url, &cert_path, &key_path).unwrap();

    let (_shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    device.register(&mut shutdown_rx).await.unwrap();
    server.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_cancelled_by_shutdown_signal() {
    let device_identity = generate_identity("bootstrap-device");
    let server_identity = generate_identity("bootstrap-server");

    let listener = listen("127.0.0.1:0", server_config(&server_identity))
        .await
        .unwrap();
    let addr = listener.addr().await.unwrap();

    let server = tokio::spawn(async move {
        let (conn, _remote) = listener.accept().await.unwrap();
        let request = recv_request(&conn).await;
        send_response(&conn, &request, ResponseType::Changed, &[]).await;
        // Withhold the finish signal; wait for the device to hang up.
        let mut buffer = vec![0u8; 16384];
        let _ = conn.recv(&mut buffer).await;
    });

    let (_dir, cert_path, key_path) = write_credentials(&device_identity);
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let url = format!("coaps://{}?aid=acct-42", addr);
    let mut device =
        Device::from_bootstrap_credentials(store, &url, &cert_path, &key_path).unwrap();

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    shutdown_tx.send(()).await.unwrap();
    let err = device.bootstrap(&mut shutdown_rx).await.unwrap_err();
    assert!(matches!(err, SessionError::Cancelled), "got {:?}", err);
    server.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_times_out_without_finish_signal() {
    let device_identity = generate_identity("bootstrap-device");
    let server_identity = generate_identity("bootstrap-server");

    let listener = listen("127.0.0.1:0", server_config(&server_identity))
        .await
        .unwrap();
    let addr = listener.addr().await.unwrap();

    let server = tokio::spawn(async move {
        let (conn, _remote) = listener.accept().await.unwrap();
        let request = recv_request(&conn).await;
        send_response(&conn, &request, ResponseType::Changed, &[]).await;
        // Never send the finish signal.
        let mut buffer = vec![0u8; 16384];
        let _ = conn.recv(&mut buffer).await;
    });

    let (_dir, cert_path, key_path) = write_credentials(&device_identity);
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let url = format!("coaps://{}?aid=acct-42", addr);
    let mut device =
        Device::from_bootstrap_credentials(store, &url, &cert_path, &key_path).unwrap();

    let (_shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    let err = device.bootstrap(&mut shutdown_rx).await.unwrap_err();
    assert!(matches!(err, SessionError::Timeout), "got {:?}", err);
    server.abort();
}
