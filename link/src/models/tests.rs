use serde_json::json;

use super::*;

// ==================== ConnectionOptions Tests ====================

#[test]
fn test_connection_options_default() {
    let opts = ConnectionOptions::default();

    assert!(opts.auto_reconnect, "auto_reconnect should default to true");
    assert_eq!(opts.reconnect_delay_ms, 1000, "reconnect_delay_ms should default to 1000");
    assert_eq!(
        opts.max_reconnect_delay_ms, 30000,
        "max_reconnect_delay_ms should default to 30000"
    );
    assert!(
        opts.max_reconnect_attempts.is_none(),
        "max_reconnect_attempts should default to None (infinite)"
    );
    assert_eq!(opts.ws_path, "/api/v1/ws/pvs");
    assert!(opts.ws_url.is_none());
}

#[test]
fn test_connection_options_builder_pattern() {
    let opts = ConnectionOptions::new()
        .with_auto_reconnect(false)
        .with_reconnect_delay_ms(2000)
        .with_max_reconnect_delay_ms(60000)
        .with_max_reconnect_attempts(Some(5))
        .with_ws_url("ws://feed.local/live");

    assert!(!opts.auto_reconnect);
    assert_eq!(opts.reconnect_delay_ms, 2000);
    assert_eq!(opts.max_reconnect_delay_ms, 60000);
    assert_eq!(opts.max_reconnect_attempts, Some(5));
    assert_eq!(opts.ws_url.as_deref(), Some("ws://feed.local/live"));
}

#[test]
fn test_connection_options_deserialize_partial() {
    let opts: ConnectionOptions =
        serde_json::from_value(json!({ "reconnect_delay_ms": 250 })).unwrap();
    assert_eq!(opts.reconnect_delay_ms, 250);
    assert!(opts.auto_reconnect, "missing fields fall back to defaults");
    assert_eq!(opts.max_reconnect_delay_ms, 30000);
}

// ==================== Severity Tests ====================

#[test]
fn test_severity_from_label() {
    let sev: Severity = serde_json::from_value(json!("MAJOR")).unwrap();
    assert_eq!(sev, Severity::Major);
    let sev: Severity = serde_json::from_value(json!("no_alarm")).unwrap();
    assert_eq!(sev, Severity::NoAlarm);
}

#[test]
fn test_severity_from_numeric_code() {
    let sev: Severity = serde_json::from_value(json!(1)).unwrap();
    assert_eq!(sev, Severity::Minor);
    let sev: Severity = serde_json::from_value(json!(17)).unwrap();
    assert_eq!(sev, Severity::Invalid);
}

#[test]
fn test_severity_unknown_defaults_to_invalid() {
    let sev: Severity = serde_json::from_value(json!(null)).unwrap();
    assert_eq!(sev, Severity::Invalid);
    let sev: Severity = serde_json::from_value(json!("BOGUS")).unwrap();
    assert_eq!(sev, Severity::Invalid);
    assert!(Severity::Invalid.is_alarm());
    assert!(!Severity::NoAlarm.is_alarm());
}

#[test]
fn test_severity_serializes_screaming_snake() {
    assert_eq!(serde_json::to_value(Severity::NoAlarm).unwrap(), json!("NO_ALARM"));
    assert_eq!(Severity::Major.to_string(), "MAJOR");
}

// ==================== PvValue Tests ====================

#[test]
fn test_pv_value_full_payload() {
    let pv: PvValue = serde_json::from_value(json!({
        "value": 3.25,
        "status": "HIGH",
        "severity": "MINOR",
        "connected": true,
        "updatedAt": 1700000000.5,
        "units": "mA"
    }))
    .unwrap();

    assert_eq!(pv.as_f64(), Some(3.25));
    assert_eq!(pv.status.as_deref(), Some("HIGH"));
    assert_eq!(pv.severity, Severity::Minor);
    assert!(pv.connected);
    assert_eq!(pv.updated_at, Some(1700000000.5));
    assert_eq!(pv.units.as_deref(), Some("mA"));
}

#[test]
fn test_pv_value_minimal_payload_uses_fail_safe_defaults() {
    let pv: PvValue = serde_json::from_value(json!({ "value": "AUTO" })).unwrap();
    assert_eq!(pv.value, json!("AUTO"));
    assert_eq!(pv.severity, Severity::Invalid, "absent severity must be INVALID");
    assert!(!pv.connected, "absent connected flag means not connected");
    assert!(pv.updated_at.is_none());
}

#[test]
fn test_pv_value_timestamp_aliases() {
    let a: PvValue = serde_json::from_value(json!({ "value": 1, "updated_at": 10.0 })).unwrap();
    let b: PvValue = serde_json::from_value(json!({ "value": 1, "timestamp": 11.0 })).unwrap();
    assert_eq!(a.updated_at, Some(10.0));
    assert_eq!(b.updated_at, Some(11.0));
}

#[test]
fn test_pv_value_timestamp_precedence() {
    let pv: PvValue = serde_json::from_value(json!({
        "value": 1,
        "timestamp": 3.0,
        "updated_at": 2.0,
        "updatedAt": 1.0
    }))
    .unwrap();
    assert_eq!(pv.updated_at, Some(1.0));

    let pv: PvValue =
        serde_json::from_value(json!({ "value": 1, "timestamp": 3.0, "updated_at": 2.0 })).unwrap();
    assert_eq!(pv.updated_at, Some(2.0));
}

#[test]
fn test_pv_value_null_connected_is_disconnected() {
    let pv: PvValue = serde_json::from_value(json!({ "value": 1, "connected": null })).unwrap();
    assert!(!pv.connected);
}

#[test]
fn test_pv_value_decode_batch_skips_bad_entries() {
    let data = serde_json::from_value(json!({
        "BAD:NUMBER": 5,
        "BAD:STAMP": { "value": 1, "updatedAt": "x" },
        "GOOD": { "value": 2.5, "connected": true, "updatedAt": 10.0 }
    }))
    .unwrap();
    let values = PvValue::decode_batch(data);
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].0, "GOOD");
    assert_eq!(values[0].1.as_f64(), Some(2.5));
}

#[test]
fn test_pv_value_array_value() {
    let pv: PvValue =
        serde_json::from_value(json!({ "value": [1, 2, 3], "connected": true })).unwrap();
    assert!(pv.value.is_array());
    assert!(pv.as_f64().is_none());
}

// ==================== Wire message Tests ====================

#[test]
fn test_client_subscribe_wire_format() {
    let msg = ClientMessage::Subscribe {
        pv_names: vec!["SR:C01:BPM1:X".to_string(), "SR:C01:BPM1:Y".to_string()],
    };
    assert_eq!(
        serde_json::to_value(&msg).unwrap(),
        json!({ "type": "subscribe", "pvNames": ["SR:C01:BPM1:X", "SR:C01:BPM1:Y"] })
    );
}

#[test]
fn test_client_unsubscribe_wire_format() {
    let msg = ClientMessage::Unsubscribe {
        pv_names: vec!["PV:A".to_string()],
    };
    assert_eq!(
        serde_json::to_value(&msg).unwrap(),
        json!({ "type": "unsubscribe", "pvNames": ["PV:A"] })
    );
    assert_eq!(msg.pv_names(), &["PV:A".to_string()]);
}

#[test]
fn test_server_initial_and_aliases() {
    for kind in ["initial", "subscribe-ack", "initial_values", "initial-values"] {
        let msg: ServerMessage = serde_json::from_value(json!({
            "type": kind,
            "data": { "PV:A": { "value": 1, "connected": true } }
        }))
        .unwrap();
        let event = FeedEvent::from(msg);
        match event {
            FeedEvent::Values { kind, values } => {
                assert_eq!(kind, UpdateKind::Initial);
                assert_eq!(values.len(), 1);
                assert_eq!(values[0].0, "PV:A");
            },
            other => panic!("unexpected event {:?}", other),
        }
    }
}

#[test]
fn test_server_diff_and_update_alias() {
    for kind in ["diff", "update"] {
        let msg: ServerMessage = serde_json::from_value(json!({
            "type": kind,
            "data": { "PV:A": { "value": 2 }, "PV:B": { "value": 3 } }
        }))
        .unwrap();
        let event = FeedEvent::from(msg);
        assert_eq!(event.value_count(), 2);
        assert!(matches!(event, FeedEvent::Values { kind: UpdateKind::Diff, .. }));
    }
}

#[test]
fn test_server_heartbeat_and_error() {
    let hb: ServerMessage = serde_json::from_value(json!({ "type": "heartbeat" })).unwrap();
    assert!(matches!(FeedEvent::from(hb), FeedEvent::Heartbeat));

    let err: ServerMessage =
        serde_json::from_value(json!({ "type": "error", "message": "bad pv" })).unwrap();
    let event = FeedEvent::from(err);
    assert!(event.is_error());
    assert_eq!(event.value_count(), 0);
}

#[test]
fn test_server_mixed_batch_keeps_good_entries() {
    let msg: ServerMessage = serde_json::from_value(json!({
        "type": "diff",
        "data": {
            "A": 5,
            "B": { "value": 7, "connected": null, "updatedAt": 1.0, "timestamp": 2.0 }
        }
    }))
    .unwrap();
    match FeedEvent::from(msg) {
        FeedEvent::Values { kind, values } => {
            assert_eq!(kind, UpdateKind::Diff);
            assert_eq!(values.len(), 1);
            assert_eq!(values[0].0, "B");
            assert!(!values[0].1.connected);
            assert_eq!(values[0].1.updated_at, Some(1.0));
        },
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn test_server_null_data_and_message() {
    let msg: ServerMessage = serde_json::from_value(json!({ "type": "snapshot", "data": null })).unwrap();
    assert_eq!(FeedEvent::from(msg).value_count(), 0);

    let msg: ServerMessage = serde_json::from_value(json!({ "type": "initial" })).unwrap();
    assert!(matches!(FeedEvent::from(msg), FeedEvent::Values { kind: UpdateKind::Initial, .. }));

    let err: ServerMessage = serde_json::from_value(json!({ "type": "error", "message": null })).unwrap();
    assert!(FeedEvent::from(err).is_error());
}

#[test]
fn test_server_unknown_type_is_not_an_error() {
    let msg: ServerMessage =
        serde_json::from_value(json!({ "type": "presence", "users": 3 })).unwrap();
    assert!(matches!(FeedEvent::from(msg), FeedEvent::Unknown));
}

// ==================== Envelope / heartbeat Tests ====================

#[test]
fn test_api_response_success() {
    let resp: ApiResponse<std::collections::HashMap<String, PvValue>> =
        serde_json::from_value(json!({
            "errorCode": 0,
            "errorMessage": null,
            "payload": { "PV:A": { "value": 5, "connected": true } }
        }))
        .unwrap();
    assert!(resp.is_success());
    assert_eq!(resp.payload.unwrap().len(), 1);
}

#[test]
fn test_api_response_error_text() {
    let resp: ApiResponse<serde_json::Value> =
        serde_json::from_value(json!({ "errorCode": 404, "errorMessage": "" })).unwrap();
    assert!(!resp.is_success());
    assert_eq!(resp.error_text(), "error code 404");
}

#[test]
fn test_heartbeat_payload_envelope() {
    let resp: ApiResponse<HeartbeatPayload> = serde_json::from_value(json!({
        "payload": { "alive": true, "timestamp": 1700000000.0, "age_seconds": 1.5 }
    }))
    .unwrap();
    assert!(resp.is_success(), "missing errorCode means success");
    let payload = resp.payload.unwrap();
    assert!(payload.alive);
    assert_eq!(payload.age_seconds, Some(1.5));
}

#[test]
fn test_heartbeat_state_failed_is_dead() {
    let now = std::time::SystemTime::now();
    let state = HeartbeatState::failed(now);
    assert!(!state.alive);
    assert!(state.age_seconds.is_none());
    assert!(!state.is_unknown());
    assert!(HeartbeatState::default().is_unknown());
}

// ==================== ChannelState Tests ====================

#[test]
fn test_channel_state_transitions() {
    use ChannelState::*;
    assert!(Disconnected.can_transition_to(Connecting));
    assert!(Connecting.can_transition_to(Open));
    assert!(Open.can_transition_to(Closing));
    assert!(Closing.can_transition_to(Disconnected));
    assert!(!Disconnected.can_transition_to(Open), "must pass through Connecting");
    assert!(!Open.can_transition_to(Connecting));
    assert_eq!(Open.to_string(), "open");
}
