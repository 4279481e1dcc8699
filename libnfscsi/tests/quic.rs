//! Client and server talking over a real loopback QUIC connection.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use libnfscsi::mount::FakeMounter;
use libnfscsi::transport::client::CsiClient;
use libnfscsi::transport::server::CsiServer;
use libnfscsi::*;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

struct Harness {
    client: CsiClient,
    server: Arc<CsiServer<NfsBackend>>,
    _tmp: tempfile::TempDir,
}

async fn start() -> Harness {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
    let cert_der = CertificateDer::from(cert.cert.der().to_vec());
    let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));

    let server_tls = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der)
        .unwrap();
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let client_tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let tmp = tempfile::tempdir().unwrap();
    let config = NfsDriverConfig {
        node_id: "quic-node".into(),
        working_mount_dir: tmp.path().to_path_buf(),
        ..Default::default()
    };
    let backend = Arc::new(NfsBackend::new(config, Arc::new(FakeMounter::new())));
    let server = Arc::new(
        CsiServer::new(
            SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            server_tls,
            backend,
            Duration::from_secs(5),
        )
        .unwrap(),
    );
    let addr = server.endpoint().local_addr().unwrap();
    let serving = Arc::clone(&server);
    tokio::spawn(async move { serving.serve().await });

    let client = CsiClient::connect(addr, "localhost", client_tls)
        .await
        .unwrap();
    Harness {
        client,
        server,
        _tmp: tmp,
    }
}

#[tokio::test]
async fn create_validate_delete_over_quic() {
    let h = start().await;
    assert!(h.client.probe().await.unwrap());

    let volume = h
        .client
        .create_volume(CreateVolumeRequest {
            name: "pvc-quic".into(),
            capacity_bytes: 0,
            volume_capabilities: vec![VolumeCapability::mount(AccessMode::MultiNodeMultiWriter)],
            parameters: HashMap::from([
                ("server".to_owned(), "nfs.example".to_owned()),
                ("share".to_owned(), "exports".to_owned()),
            ]),
        })
        .await
        .unwrap();
    assert_eq!(volume.volume_id.as_str(), "nfs.example/exports/pvc-quic");

    let block = VolumeCapability {
        access_type: Some(AccessType::Block),
        access_mode: Some(AccessMode::SingleNodeWriter),
    };
    assert!(
        !h.client
            .validate_volume_capabilities(&volume.volume_id, vec![block])
            .await
            .unwrap()
    );

    h.client.delete_volume(&volume.volume_id).await.unwrap();
    h.client.close();
    h.server.endpoint().close(0u32.into(), b"done");
}

#[tokio::test]
async fn errors_keep_their_status_over_quic() {
    let h = start().await;

    let err = h
        .client
        .create_volume(CreateVolumeRequest {
            name: "pvc-bad".into(),
            volume_capabilities: vec![VolumeCapability::mount(AccessMode::MultiNodeMultiWriter)],
            parameters: HashMap::from([("server".to_owned(), "nfs.example".to_owned())]),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), StatusCode::InvalidArgument);

    let err = h
        .client
        .delete_volume(&"not-a-volume-id".into())
        .await
        .unwrap_err();
    assert_eq!(err.code(), StatusCode::InvalidArgument);

    // Staging is off on this plugin.
    let err = h
        .client
        .unstage_volume(&"nfs.example/exports/v".into(), "/staging")
        .await
        .unwrap_err();
    assert_eq!(err.code(), StatusCode::Unimplemented);
    h.client.close();
}
