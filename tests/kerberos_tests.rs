//! Integration tests for Kerberos authentication and message encryption,
//! driven through the fake GSS provider.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pretty_assertions::assert_eq;

use common::*;
use winrm_client::auth::encryption::ENCRYPTED_CONTENT_TYPE;
use winrm_client::enumerate::{EnumInfo, DEFAULT_RESOURCE_URI};
use winrm_client::Error;

const WQL: &str = "Select * from Win32_ComputerSystem";

/// Answers the probe with a challenge and everything else with the
/// encrypted `select *` fixture.
fn encrypted_server(request: &RecordedRequest) -> winrm_client::Result<Reply> {
    if request.is_probe() {
        return Ok(kerberos_challenge());
    }
    let plain = unseal(&request.body);
    assert_eq!(action_of(&plain).as_deref(), Some("Enumerate"));
    Ok(Reply::ok(seal(&load_fixture_bytes("enum_select_star.xml"))))
}

/// Probe or decrypted action of every request.
fn decrypted_actions(transport: &FakeTransport) -> Vec<String> {
    transport
        .requests()
        .iter()
        .map(|request| {
            if request.is_probe() {
                "probe".to_string()
            } else {
                action_of(&unseal(&request.body)).unwrap_or_default()
            }
        })
        .collect()
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_handshake_and_encrypted_round_trip() {
    let transport = Arc::new(FakeTransport::new(encrypted_server));
    let gss = Arc::new(FakeGss::default());
    let client = kerberos_client(transport.clone(), gss.clone());

    let items = client
        .enumerate_client(kerberos_conn_info("win01.example.com"))
        .unwrap()
        .enumerate(WQL, DEFAULT_RESOURCE_URI)
        .await
        .unwrap();
    assert_eq!(items[0].get_str("Name"), Some("AMAZONA-Q2R281F"));

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);

    let probe = &requests[0];
    assert!(probe.is_probe());
    assert_eq!(probe.header("Content-Length"), Some("0"));
    assert_eq!(probe.header("Authorization"), None);

    let request = &requests[1];
    assert_eq!(request.header("Authorization"), Some(KERBEROS_AUTHORIZATION));
    assert_eq!(request.header("Content-Type"), Some(ENCRYPTED_CONTENT_TYPE));
    assert!(request.body.starts_with(b"--Encrypted Boundary\r\n"));
    assert!(!request.body_text().contains(WQL));

    assert_eq!(gss.services(), vec!["HTTP@win01.example.com"]);
}

#[tokio::test]
async fn test_security_context_reused_across_requests() {
    let transport = Arc::new(FakeTransport::new(encrypted_server));
    let gss = Arc::new(FakeGss::default());
    let client = kerberos_client(transport.clone(), gss.clone());
    let enumerate = client
        .enumerate_client(kerberos_conn_info("win01.example.com"))
        .unwrap();

    enumerate.enumerate(WQL, DEFAULT_RESOURCE_URI).await.unwrap();
    enumerate.enumerate(WQL, DEFAULT_RESOURCE_URI).await.unwrap();

    assert_eq!(
        decrypted_actions(&transport),
        vec!["probe", "Enumerate", "Enumerate"]
    );
    assert_eq!(gss.contexts_created(), 1);
    let session = client.sessions().get(enumerate.key()).unwrap();
    assert!(session.has_security_context().await);
}

#[tokio::test]
async fn test_probe_without_401_fails() {
    let transport = Arc::new(FakeTransport::new(|_| Ok(Reply::ok("listener up"))));
    let client = kerberos_client(transport.clone(), Arc::new(FakeGss::default()));

    let err = client
        .enumerate_client(kerberos_conn_info("win01.example.com"))
        .unwrap()
        .enumerate(WQL, DEFAULT_RESOURCE_URI)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Kerberos(_)));
    assert!(err.to_string().contains("status code 200"));
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test]
async fn test_challenge_without_kerberos_is_unauthorized() {
    let transport = Arc::new(FakeTransport::new(|_| {
        Ok(Reply::status(401, "").header("WWW-Authenticate", "Negotiate"))
    }));
    let client = kerberos_client(transport, Arc::new(FakeGss::default()));

    let err = client
        .enumerate_client(kerberos_conn_info("win01.example.com"))
        .unwrap()
        .enumerate(WQL, DEFAULT_RESOURCE_URI)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Unauthorized(_)));
}

// ============================================================================
// Reauthentication
// ============================================================================

#[tokio::test]
async fn test_rejected_context_reauthenticates_once() {
    init_tracing();
    let encrypted_requests = AtomicUsize::new(0);
    let transport = Arc::new(FakeTransport::new(move |request| {
        if request.is_probe() {
            return Ok(kerberos_challenge());
        }
        if encrypted_requests.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(Reply::status(401, ""));
        }
        Ok(Reply::ok(seal(&load_fixture_bytes("enum_select_star.xml"))))
    }));
    let gss = Arc::new(FakeGss::default());
    let client = kerberos_client(transport.clone(), gss.clone());

    let items = client
        .enumerate_client(kerberos_conn_info("win01.example.com"))
        .unwrap()
        .enumerate(WQL, DEFAULT_RESOURCE_URI)
        .await
        .unwrap();

    assert_eq!(items.len(), 1);
    assert_eq!(
        decrypted_actions(&transport),
        vec!["probe", "Enumerate", "probe", "Enumerate"]
    );
    assert_eq!(gss.contexts_created(), 2);
}

#[tokio::test]
async fn test_persistent_rejection_is_unauthorized() {
    let transport = Arc::new(FakeTransport::new(|request| {
        if request.is_probe() {
            Ok(kerberos_challenge())
        } else {
            Ok(Reply::status(401, ""))
        }
    }));
    let client = kerberos_client(transport.clone(), Arc::new(FakeGss::default()));

    let err = client
        .enumerate_client(kerberos_conn_info("win01.example.com"))
        .unwrap()
        .enumerate(WQL, DEFAULT_RESOURCE_URI)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Unauthorized(_)));
    assert_eq!(transport.request_count(), 4);
}

#[tokio::test]
async fn test_bad_request_on_context_reauthenticates_once() {
    let encrypted_requests = AtomicUsize::new(0);
    let transport = Arc::new(FakeTransport::new(move |request| {
        if request.is_probe() {
            return Ok(kerberos_challenge());
        }
        if encrypted_requests.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(Reply::status(400, ""));
        }
        Ok(Reply::ok(seal(&load_fixture_bytes("enum_select_star.xml"))))
    }));
    let gss = Arc::new(FakeGss::default());
    let client = kerberos_client(transport.clone(), gss.clone());

    let items = client
        .enumerate_client(kerberos_conn_info("win01.example.com"))
        .unwrap()
        .enumerate(WQL, DEFAULT_RESOURCE_URI)
        .await
        .unwrap();

    assert_eq!(items[0].get_str("Name"), Some("AMAZONA-Q2R281F"));
    assert_eq!(
        decrypted_actions(&transport),
        vec!["probe", "Enumerate", "probe", "Enumerate"]
    );
    assert_eq!(gss.contexts_created(), 2);
}

#[tokio::test]
async fn test_persistent_bad_request_is_unauthorized() {
    let transport = Arc::new(FakeTransport::new(|request| {
        if request.is_probe() {
            Ok(kerberos_challenge())
        } else {
            Ok(Reply::status(400, ""))
        }
    }));
    let client = kerberos_client(transport.clone(), Arc::new(FakeGss::default()));

    let err = client
        .enumerate_client(kerberos_conn_info("win01.example.com"))
        .unwrap()
        .enumerate(WQL, DEFAULT_RESOURCE_URI)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Unauthorized(_)));
    assert_eq!(transport.request_count(), 4);
}

#[tokio::test]
async fn test_persistent_bad_request_aborts_batch() {
    let transport = Arc::new(FakeTransport::new(|request| {
        if request.is_probe() {
            Ok(kerberos_challenge())
        } else {
            Ok(Reply::status(400, ""))
        }
    }));
    let client = kerberos_client(transport.clone(), Arc::new(FakeGss::default()));
    let enumerate = client
        .enumerate_client(kerberos_conn_info("win01.example.com"))
        .unwrap();

    let err = enumerate
        .do_collect(&[
            EnumInfo::new(WQL),
            EnumInfo::new("Select * from Win32_OperatingSystem"),
        ])
        .await
        .unwrap_err();

    assert!(err.is_credential_failure());
    // The second query is never sent
    assert_eq!(transport.request_count(), 4);
}

#[tokio::test]
async fn test_encrypted_fault_is_decrypted() {
    let transport = Arc::new(FakeTransport::new(|request| {
        if request.is_probe() {
            Ok(kerberos_challenge())
        } else {
            Ok(Reply::status(500, seal(&load_fixture_bytes("fault.xml"))))
        }
    }));
    let client = kerberos_client(transport, Arc::new(FakeGss::default()));

    let err = client
        .enumerate_client(kerberos_conn_info("win01.example.com"))
        .unwrap()
        .enumerate(WQL, DEFAULT_RESOURCE_URI)
        .await
        .unwrap_err();

    match err {
        Error::Request { status, message } => {
            assert_eq!(status, 500);
            assert!(message.starts_with("The data source could not process the filter."));
        }
        other => panic!("expected request error, got {:?}", other),
    }
}
