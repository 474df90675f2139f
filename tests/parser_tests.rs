//! Integration tests for enumeration response parsing.
//!
//! Covers both response dialects (`select *` instances and `XmlFragment`
//! field lists), nil versus absent properties, repeated-property folding,
//! typed datetimes, pagination markers and the nesting guard.

mod common;

use chrono::NaiveDate;
use futures::StreamExt;
use pretty_assertions::assert_eq;

use common::*;
use winrm_client::response::{parse_slice, parse_stream, ParsedResponse, Value};
use winrm_client::transport::ResponseBody;
use winrm_client::Error;

fn parse_fixture(name: &str) -> ParsedResponse {
    parse_slice(&load_fixture_bytes(name)).expect("fixture parses")
}

fn roles() -> Value {
    Value::List(vec![
        Value::from("LM_Workstation"),
        Value::from("LM_Server"),
        Value::from("NT"),
        Value::from("Server_NT"),
    ])
}

// ============================================================================
// Dialects
// ============================================================================

#[test]
fn test_select_star_instance() {
    let parsed = parse_fixture("enum_select_star.xml");
    assert_eq!(parsed.items.len(), 1);

    let item = &parsed.items[0];
    assert_eq!(item.get_str("Domain"), Some("WORKGROUP"));
    assert_eq!(item.get_str("Manufacturer"), Some("Xen"));
    assert_eq!(item.get_str("Name"), Some("AMAZONA-Q2R281F"));
    assert_eq!(item.get("Roles"), Some(&roles()));
    assert!(item.contains("TotalPhysicalMemory"));
}

#[test]
fn test_fragment_matches_select_star() {
    let star = parse_fixture("enum_select_star.xml");
    let fragment = parse_fixture("enum_fragment.xml");

    let star = &star.items[0];
    let fragment = &fragment.items[0];
    for name in fragment.property_names() {
        assert_eq!(fragment.get(name), star.get(name), "property {}", name);
    }
    assert_eq!(
        fragment.property_names().collect::<Vec<_>>(),
        vec!["Domain", "Name", "PrimaryOwnerContact", "Roles"]
    );
}

#[tokio::test]
async fn test_stream_matches_slice_across_chunks() {
    let body = Reply::fixture("enum_select_star.xml");
    let chunks: Vec<std::io::Result<bytes::Bytes>> = body
        .body
        .chunks(7)
        .map(|chunk| Ok(bytes::Bytes::copy_from_slice(chunk)))
        .collect();
    let stream = ResponseBody::Streaming(futures::stream::iter(chunks).boxed());

    let streamed = parse_stream(stream.into_reader()).await.unwrap();
    assert_eq!(streamed, parse_fixture("enum_select_star.xml"));
}

// ============================================================================
// Nil, Absent and Repeated Properties
// ============================================================================

#[test]
fn test_nil_is_not_absent() {
    let parsed = parse_fixture("enum_fragment.xml");
    let item = &parsed.items[0];

    assert_eq!(item.get("PrimaryOwnerContact"), Some(&Value::Nil));
    assert!(item.get("PrimaryOwnerContact").unwrap().is_nil());
    assert_eq!(item.get("Manufacturer"), None);
    assert!(!item.contains("Manufacturer"));
}

#[test]
fn test_repeated_property_becomes_list() {
    let parsed = parse_fixture("enum_fragment.xml");
    let values = parsed.items[0].get("Roles").and_then(Value::as_list).unwrap();
    assert_eq!(values.len(), 4);
    assert_eq!(values[0].as_str(), Some("LM_Workstation"));
    assert_eq!(values[3].as_str(), Some("Server_NT"));
}

// ============================================================================
// Datetimes
// ============================================================================

#[test]
fn test_datetime_values() {
    let parsed = parse_fixture("enum_datetime.xml");
    assert_eq!(parsed.items.len(), 2);
    let date = NaiveDate::from_ymd_opt(2013, 4, 9).unwrap();

    let os = &parsed.items[0];
    assert_eq!(
        os.get_str("Caption"),
        Some("Microsoft Windows Server 2008 R2 Datacenter")
    );
    assert_eq!(
        os.get("InstallDate").and_then(Value::as_datetime),
        Some(&date.and_hms_opt(15, 42, 20).unwrap())
    );
    assert_eq!(
        os.get("LastBootUpTime").and_then(Value::as_datetime),
        Some(&date.and_hms_micro_opt(15, 42, 20, 412_400).unwrap())
    );
    // Offset normalized to UTC, nanoseconds truncated
    assert_eq!(
        os.get("LocalDateTime").and_then(Value::as_datetime),
        Some(
            &NaiveDate::from_ymd_opt(2013, 4, 25)
                .unwrap()
                .and_hms_micro_opt(21, 23, 39, 123_456)
                .unwrap()
        )
    );
}

#[test]
fn test_datetime_in_fragment() {
    let parsed = parse_fixture("enum_datetime.xml");
    let fragment = &parsed.items[1];
    assert_eq!(
        fragment.get_str("Caption"),
        Some("Microsoft Windows Server 2012 Standard")
    );
    assert_eq!(
        fragment.get("LastBootUpTime").and_then(Value::as_datetime),
        Some(
            &NaiveDate::from_ymd_opt(2013, 4, 9)
                .unwrap()
                .and_hms_micro_opt(15, 42, 20, 412_400)
                .unwrap()
        )
    );
}

// ============================================================================
// Pagination Markers
// ============================================================================

#[test]
fn test_live_context_continues() {
    let parsed = parse_fixture("enum_page1.xml");
    assert_eq!(
        parsed.context.next(),
        Some("uuid:AB0F7A0E-3A1C-4A5B-8C6D-0F1E2D3C4B01")
    );
    assert_eq!(parsed.items.len(), 2);
}

#[test]
fn test_end_of_sequence_stops() {
    let parsed = parse_fixture("enum_page3.xml");
    assert!(parsed.context.end_of_sequence);
    assert_eq!(parsed.context.next(), None);
    assert_eq!(parsed.items[0].get_str("Name"), Some("Appinfo"));
}

#[test]
fn test_empty_context_stops() {
    let parsed = parse_fixture("enum_select_star.xml");
    assert_eq!(parsed.context.token.as_deref(), Some(""));
    assert_eq!(parsed.context.next(), None);
}

// ============================================================================
// Structural Guard
// ============================================================================

#[test]
fn test_nesting_too_deep_is_rejected() {
    let err = parse_slice(&load_fixture_bytes("enum_too_deep.xml")).unwrap_err();
    assert!(matches!(err, Error::ProtocolState(_)));
    assert!(err.to_string().contains("Level4"));
}

#[test]
fn test_truncated_body_is_rejected() {
    let body = load_fixture_bytes("enum_page1.xml");
    let text = String::from_utf8_lossy(&body);
    let cut = text.find("<p:Name>ALG").unwrap();
    let err = parse_slice(&body[..cut]).unwrap_err();
    assert!(matches!(err, Error::ProtocolState(_)));
}
