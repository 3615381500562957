use super::*;
use crate::ble::scripted::{ScriptedTransport, Step};
use crate::ble::transport::{MockTransport, PeripheralFilter};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::time::Duration;

fn session_on(transport: &Arc<ScriptedTransport>) -> Session<ScriptedTransport> {
    Session::new(transport.clone(), SessionConfig::default())
}

async fn ready_session() -> (Arc<ScriptedTransport>, Session<ScriptedTransport>) {
    let transport = Arc::new(ScriptedTransport::new());
    let session = session_on(&transport);
    session.connect().await.unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    (transport, session)
}

fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn transitions(events: &[SessionEvent]) -> Vec<SessionState> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::StateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect()
}

fn notices(events: &[SessionEvent]) -> Vec<Notice> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Notice(notice) => Some(notice.clone()),
            _ => None,
        })
        .collect()
}

fn log_lines(session: &Session<ScriptedTransport>) -> Vec<String> {
    session.log().iter().map(ToString::to_string).collect()
}

fn assert_cleared(session: &Session<ScriptedTransport>) {
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(session.device_name(), None);
    assert!(session.peripheral().is_none());
    assert!(session.handles().is_none());
}

// === Connect pipeline ===

#[tokio::test]
async fn test_connect_reaches_ready_with_both_handles() {
    let transport = Arc::new(ScriptedTransport::new());
    let session = session_on(&transport);
    let mut rx = session.subscribe();

    let peripheral = session.connect().await.unwrap();

    assert_eq!(peripheral.display_name(), "ESP32_BLE_UART");
    assert!(session.is_ready());
    assert_eq!(session.device_name().as_deref(), Some("ESP32_BLE_UART"));

    let handles = session.handles().unwrap();
    let connection = transport.current_connection().unwrap();
    assert_eq!(handles.write().unwrap().uuid, UART_RX_UUID);
    assert_eq!(handles.notify().unwrap().uuid, UART_TX_UUID);
    assert_eq!(handles.connection(), connection.id());
    assert_eq!(handles.write().unwrap().connection, connection.id());

    let events = drain(&mut rx);
    assert_eq!(
        transitions(&events),
        vec![
            SessionState::Requesting,
            SessionState::ConnectingGatt,
            SessionState::DiscoveringServices,
            SessionState::SubscribingNotify,
            SessionState::Ready,
        ]
    );
    assert_eq!(
        notices(&events),
        vec![Notice::info("Connected to ESP32_BLE_UART")]
    );

    assert_eq!(
        log_lines(&session),
        vec![
            "Requesting BLE device...",
            "Device found: ESP32_BLE_UART",
            "Connected to GATT server",
            "Notifications enabled",
        ]
    );
}

#[tokio::test]
async fn test_connect_applies_configured_filter() {
    let transport =
        Arc::new(ScriptedTransport::new().with_peripheral(Some(PeripheralHandle::new("x", None))));
    let session = Session::new(
        transport.clone(),
        SessionConfig::default().with_filter(PeripheralFilter::Name(
            ESP32_UART_DEVICE_NAME.to_string(),
        )),
    );

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, Error::SelectionError { .. }));
    assert_cleared(&session);
    assert_eq!(transport.call_count(Step::ConnectGatt), 0);
}

#[tokio::test]
async fn test_connect_while_active_is_rejected() {
    let transport = Arc::new(ScriptedTransport::new());
    let session = session_on(&transport);
    transport.hold(Step::RequestPeripheral);

    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.connect().await })
    };
    transport.reached(Step::RequestPeripheral).await;

    let mut rx = session.subscribe();
    let err = session.connect().await.unwrap_err();
    assert!(matches!(
        err,
        Error::SessionAlreadyActive {
            state: SessionState::Requesting
        }
    ));
    assert_eq!(session.state(), SessionState::Requesting);
    assert!(drain(&mut rx).is_empty());

    transport.release(Step::RequestPeripheral);
    first.await.unwrap().unwrap();

    let err = session.connect().await.unwrap_err();
    assert!(matches!(
        err,
        Error::SessionAlreadyActive {
            state: SessionState::Ready
        }
    ));
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(transport.call_count(Step::RequestPeripheral), 1);
}

#[tokio::test]
async fn test_selection_cancelled() {
    let transport = Arc::new(ScriptedTransport::new().with_peripheral(None));
    let session = session_on(&transport);
    let mut rx = session.subscribe();

    let err = session.connect().await.unwrap_err();

    assert!(matches!(err, Error::SelectionCancelled));
    assert_cleared(&session);
    assert_eq!(transport.call_count(Step::ConnectGatt), 0);
    assert_eq!(transport.disconnect_calls(), 0);

    let notices = notices(&drain(&mut rx));
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].level, NoticeLevel::Warning);
}

#[tokio::test]
async fn test_connection_failure() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.fail_at(
        Step::ConnectGatt,
        Error::ConnectionFailed {
            reason: "out of range".to_string(),
        },
    );
    let session = session_on(&transport);
    let mut rx = session.subscribe();

    let err = session.connect().await.unwrap_err();

    assert!(matches!(err, Error::ConnectionFailed { reason } if reason == "out of range"));
    assert_cleared(&session);
    assert_eq!(transport.disconnect_calls(), 0);
    assert_eq!(
        log_lines(&session).last().map(String::as_str),
        Some("Error: Connection failed: out of range")
    );
    assert_eq!(notices(&drain(&mut rx))[0].level, NoticeLevel::Error);
}

#[tokio::test]
async fn test_service_not_found_disconnects_once() {
    let transport = Arc::new(ScriptedTransport::new().without_service(UART_SERVICE_UUID));
    let session = Session::new(
        transport.clone(),
        SessionConfig::default().with_filter(PeripheralFilter::Any),
    );
    let mut rx = session.subscribe();

    let err = session.connect().await.unwrap_err();

    assert!(matches!(err, Error::ServiceNotFound { uuid } if uuid == UART_SERVICE_UUID.to_string()));
    assert_eq!(transport.disconnect_calls(), 1);
    assert_cleared(&session);
    assert_eq!(
        transitions(&drain(&mut rx)),
        vec![
            SessionState::Requesting,
            SessionState::ConnectingGatt,
            SessionState::DiscoveringServices,
            SessionState::Disconnecting,
            SessionState::Disconnected,
        ]
    );

    let lines = log_lines(&session);
    assert_eq!(
        &lines[lines.len() - 2..],
        &[
            format!("Error: Service not found: {}", UART_SERVICE_UUID),
            "Disconnected (after failure)".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_characteristic_not_found_disconnects_once() {
    let transport = Arc::new(ScriptedTransport::new().without_characteristic(UART_RX_UUID));
    let session = session_on(&transport);

    let err = session.connect().await.unwrap_err();

    assert!(
        matches!(err, Error::CharacteristicNotFound { uuid } if uuid == UART_RX_UUID.to_string())
    );
    assert_eq!(transport.disconnect_calls(), 1);
    assert_eq!(transport.call_count(Step::Subscribe), 0);
    assert_cleared(&session);
}

#[tokio::test]
async fn test_subscription_failure_disconnects_once() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.fail_at(
        Step::Subscribe,
        Error::SubscriptionFailed {
            reason: "CCCD write rejected".to_string(),
        },
    );
    let session = session_on(&transport);

    let err = session.connect().await.unwrap_err();

    assert!(matches!(err, Error::SubscriptionFailed { .. }));
    assert_eq!(transport.disconnect_calls(), 1);
    assert_cleared(&session);
}

#[tokio::test]
async fn test_discovery_errors_map_to_not_found() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.fail_at(
        Step::ResolveService,
        Error::ReadFailed {
            reason: "GATT timeout".to_string(),
        },
    );
    let session = session_on(&transport);

    let err = session.connect().await.unwrap_err();

    assert!(matches!(err, Error::ServiceNotFound { uuid } if uuid == UART_SERVICE_UUID.to_string()));
    assert_eq!(transport.disconnect_calls(), 1);
    assert_cleared(&session);

    transport.fail_at(
        Step::ResolveCharacteristic,
        Error::NotSupported {
            operation: "notify".to_string(),
        },
    );

    let err = session.connect().await.unwrap_err();

    assert!(matches!(err, Error::CharacteristicNotFound { uuid } if uuid == UART_TX_UUID.to_string()));
    assert_eq!(transport.disconnect_calls(), 2);
    assert_cleared(&session);
}

#[tokio::test]
async fn test_service_not_found_with_mock_transport() {
    let peripheral = PeripheralHandle::new("mock-1", Some(ESP32_UART_DEVICE_NAME.to_string()));
    let connection = ConnectionHandle::new(peripheral.clone());
    let connection_id = connection.id();

    let mut transport = MockTransport::new();
    transport
        .expect_request_peripheral()
        .times(1)
        .returning(move |_| Ok(peripheral.clone()));
    transport
        .expect_connect_gatt()
        .times(1)
        .returning(move |_| Ok(connection.clone()));
    transport
        .expect_on_disconnected()
        .times(1)
        .return_const(());
    transport
        .expect_resolve_service()
        .times(1)
        .returning(|_, uuid| {
            Err(Error::ServiceNotFound {
                uuid: uuid.to_string(),
            })
        });
    transport.expect_resolve_characteristic().never();
    transport.expect_subscribe().never();
    transport
        .expect_disconnect()
        .withf(move |c| c.id() == connection_id)
        .times(1)
        .returning(|_| Ok(()));

    let session = Session::new(Arc::new(transport), SessionConfig::default());
    let err = session.connect().await.unwrap_err();

    assert!(matches!(err, Error::ServiceNotFound { .. }));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_read_only_profile_skips_subscribe() {
    let profile = ServiceProfile::battery();
    let transport = Arc::new(
        ScriptedTransport::for_profile(&profile).with_value(
            BATTERY_SERVICE_UUID,
            BATTERY_LEVEL_UUID,
            vec![87],
        ),
    );
    let session = Session::new(transport.clone(), SessionConfig::new(profile));

    session.connect().await.unwrap();

    assert!(session.is_ready());
    assert_eq!(transport.call_count(Step::Subscribe), 0);
    assert_eq!(session.read_battery_level().await.unwrap(), 87);
    assert!(matches!(
        session.send(b"x").await,
        Err(Error::NotReady)
    ));
    assert!(transport.writes().is_empty());
}

#[tokio::test]
async fn test_read_string_from_device_information() {
    let profile = ServiceProfile::device_information();
    let transport = Arc::new(
        ScriptedTransport::for_profile(&profile)
            .with_value(DEVICE_INFO_SERVICE_UUID, MANUFACTURER_NAME_UUID, "Espressif")
            .with_value(DEVICE_INFO_SERVICE_UUID, SERIAL_NUMBER_UUID, vec![0xff, 0xfe]),
    );
    let session = Session::new(transport, SessionConfig::new(profile));
    session.connect().await.unwrap();

    assert_eq!(session.read_manufacturer_name().await.unwrap(), "Espressif");
    assert!(matches!(
        session.read_serial_number().await,
        Err(Error::ReadFailed { .. })
    ));
    assert!(matches!(
        session.read_model_number().await,
        Err(Error::CharacteristicNotFound { .. })
    ));
}

// === Link loss ===

#[tokio::test]
async fn test_link_loss_while_ready() {
    let (transport, session) = ready_session().await;
    let mut rx = session.subscribe();

    transport.drop_link();

    assert_cleared(&session);
    assert_eq!(transport.disconnect_calls(), 0);
    let events = drain(&mut rx);
    assert_eq!(transitions(&events), vec![SessionState::Disconnected]);
    assert_eq!(
        notices(&events),
        vec![Notice::error("Connection to ESP32_BLE_UART lost")]
    );
    assert_eq!(
        log_lines(&session).last().map(String::as_str),
        Some("Disconnected (link lost)")
    );
}

async fn assert_link_loss_during(step: Step, state: SessionState) {
    let transport = Arc::new(ScriptedTransport::new());
    let session = session_on(&transport);
    transport.hold(step);

    let connect = {
        let session = session.clone();
        tokio::spawn(async move { session.connect().await })
    };
    transport.reached(step).await;
    assert_eq!(session.state(), state);

    transport.drop_link();
    assert_cleared(&session);

    transport.release(step);
    let err = connect.await.unwrap().unwrap_err();

    assert!(matches!(err, Error::UnexpectedDisconnect), "{:?}: {}", step, err);
    assert_cleared(&session);
    assert_eq!(transport.disconnect_calls(), 0);
    assert!(!log_lines(&session).iter().any(|l| l.starts_with("Error")));
}

#[tokio::test]
async fn test_link_loss_during_discovery() {
    assert_link_loss_during(Step::ResolveService, SessionState::DiscoveringServices).await;
    assert_link_loss_during(Step::ResolveCharacteristic, SessionState::DiscoveringServices).await;
}

#[tokio::test]
async fn test_link_loss_during_subscribe() {
    assert_link_loss_during(Step::Subscribe, SessionState::SubscribingNotify).await;
}

#[tokio::test]
async fn test_link_lost_before_disconnect_registration() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.disconnect_at(Step::ConnectGatt);
    let session = session_on(&transport);
    let mut rx = session.subscribe();

    let err = session.connect().await.unwrap_err();

    assert!(matches!(err, Error::UnexpectedDisconnect));
    assert_cleared(&session);
    assert_eq!(transport.disconnect_calls(), 0);
    assert_eq!(transport.call_count(Step::ResolveCharacteristic), 0);
    assert_eq!(
        transitions(&drain(&mut rx)),
        vec![
            SessionState::Requesting,
            SessionState::ConnectingGatt,
            SessionState::DiscoveringServices,
            SessionState::Disconnected,
        ]
    );
    let lines = log_lines(&session);
    assert_eq!(lines.last().map(String::as_str), Some("Disconnected (link lost)"));
    assert!(!lines.iter().any(|l| l.starts_with("Error")));

    session.connect().await.unwrap();
    assert!(session.is_ready());
}

#[tokio::test]
async fn test_disconnect_wins_over_step_error() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.disconnect_at(Step::ResolveService);
    transport.fail_at(
        Step::ResolveService,
        Error::ServiceNotFound {
            uuid: UART_SERVICE_UUID.to_string(),
        },
    );
    let session = session_on(&transport);

    let err = session.connect().await.unwrap_err();

    assert!(matches!(err, Error::UnexpectedDisconnect));
    assert_cleared(&session);
    assert_eq!(transport.disconnect_calls(), 0);
    assert_eq!(
        log_lines(&session).last().map(String::as_str),
        Some("Disconnected (link lost)")
    );
}

#[tokio::test]
async fn test_stale_events_are_ignored() {
    let (transport, session) = ready_session().await;
    let stale = transport.current_connection().unwrap();

    transport.drop_link();
    session.connect().await.unwrap();
    let entries = session.log().len();

    session.handle_event(TransportEvent::Notification {
        connection: stale.id(),
        characteristic: UART_TX_UUID,
        data: Bytes::from_static(b"late"),
    });
    session.handle_event(TransportEvent::Disconnected {
        connection: stale.id(),
    });

    assert!(session.is_ready());
    assert_eq!(session.log().len(), entries);
}

// === Frames ===

#[tokio::test]
async fn test_frames_logged_in_arrival_order() {
    let (transport, session) = ready_session().await;
    let mut rx = session.subscribe();

    for payload in ["A", "B", "C"] {
        assert!(transport.notify(UART_TX_UUID, payload.as_bytes().to_vec()));
    }

    let frames: Vec<_> = session
        .log()
        .frames()
        .filter_map(|f| f.text().map(str::to_string))
        .collect();
    assert_eq!(frames, vec!["A", "B", "C"]);

    let received: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::FrameReceived(frame) => frame.text().map(str::to_string),
            _ => None,
        })
        .collect();
    assert_eq!(received, vec!["A", "B", "C"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_emission_keeps_per_source_order() {
    let (transport, session) = ready_session().await;

    let emitters: Vec<_> = (0..4)
        .map(|source| {
            let transport = transport.clone();
            tokio::task::spawn_blocking(move || {
                for seq in 0..50 {
                    transport.notify(UART_TX_UUID, format!("{}:{}", source, seq).into_bytes());
                }
            })
        })
        .collect();
    for emitter in emitters {
        emitter.await.unwrap();
    }

    let mut last_seen = [None::<u32>; 4];
    let mut total = 0;
    for frame in session.log().frames() {
        let text = frame.text().unwrap();
        let (source, seq) = text.split_once(':').unwrap();
        let source: usize = source.parse().unwrap();
        let seq: u32 = seq.parse().unwrap();
        assert_eq!(last_seen[source].map(|s| s + 1).unwrap_or(0), seq);
        last_seen[source] = Some(seq);
        total += 1;
    }
    assert_eq!(total, 200);
}

#[tokio::test]
async fn test_invalid_utf8_frame_is_kept() {
    let (transport, session) = ready_session().await;

    transport.notify(UART_TX_UUID, vec![0x68, 0xff, 0x69]);

    let log = session.log();
    let frame = log.frames().next().unwrap();
    assert!(frame.has_decode_error());
    assert_eq!(frame.data().as_ref(), &[0x68, 0xff, 0x69]);
    assert_eq!(frame.text(), Some("h\u{fffd}i"));
}

#[tokio::test]
async fn test_binary_frames_without_text_decoding() {
    let transport = Arc::new(ScriptedTransport::new());
    let session = Session::new(
        transport.clone(),
        SessionConfig::default().with_text_frames(false),
    );
    session.connect().await.unwrap();

    transport.notify(UART_TX_UUID, vec![0xca, 0xfe]);

    let log = session.log();
    let frame = log.frames().next().unwrap();
    assert_eq!(frame.text(), None);
    assert_eq!(frame.to_string(), "CA FE");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_frames_match_emission(payloads in proptest::collection::vec(
        proptest::collection::vec(any::<u8>(), 0..24),
        0..40,
    )) {
        let logged = tokio_test::block_on(async {
            let (transport, session) = ready_session().await;
            for payload in &payloads {
                transport.notify(UART_TX_UUID, payload.clone());
            }
            session
                .log()
                .frames()
                .map(|f| f.data().to_vec())
                .collect::<Vec<_>>()
        });

        prop_assert_eq!(logged, payloads);
    }
}

// === Send ===

#[tokio::test]
async fn test_send_writes_exact_bytes() {
    let (transport, session) = ready_session().await;

    session.send(b"hello\n").await.unwrap();
    session.send_text("ping").await.unwrap();

    assert_eq!(
        transport.writes(),
        vec![Bytes::from_static(b"hello\n"), Bytes::from_static(b"ping")]
    );
    let lines = log_lines(&session);
    assert_eq!(&lines[lines.len() - 2..], &["Sent: hello", "Sent: ping"]);
}

#[tokio::test]
async fn test_send_when_not_ready() {
    let transport = Arc::new(ScriptedTransport::new());
    let session = session_on(&transport);

    assert!(matches!(session.send(b"x").await, Err(Error::NotReady)));
    assert!(matches!(
        session.read(UART_TX_UUID).await,
        Err(Error::NotReady)
    ));
    assert_eq!(transport.call_count(Step::Write), 0);
    assert!(transport.writes().is_empty());
}

#[tokio::test]
async fn test_send_failure_keeps_session_ready() {
    let (transport, session) = ready_session().await;
    transport.fail_at(
        Step::Write,
        Error::WriteFailed {
            reason: "GATT busy".to_string(),
        },
    );
    let mut rx = session.subscribe();

    let err = session.send(b"x").await.unwrap_err();

    assert!(matches!(err, Error::WriteFailed { reason } if reason == "GATT busy"));
    assert!(session.is_ready());
    assert_eq!(notices(&drain(&mut rx))[0].level, NoticeLevel::Warning);

    session.send(b"y").await.unwrap();
    assert_eq!(transport.writes(), vec![Bytes::from_static(b"y")]);
}

#[tokio::test]
async fn test_disconnect_during_send_discards_result() {
    let (transport, session) = ready_session().await;

    for payload in ["hello", "world", "!"] {
        transport.notify(UART_TX_UUID, payload.as_bytes().to_vec());
    }

    transport.hold(Step::Write);
    let send = {
        let session = session.clone();
        tokio::spawn(async move { session.send(b"late").await })
    };
    transport.reached(Step::Write).await;

    transport.drop_link();
    transport.release(Step::Write);

    let err = send.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::UnexpectedDisconnect));
    assert_cleared(&session);

    assert_eq!(
        log_lines(&session),
        vec![
            "Requesting BLE device...",
            "Device found: ESP32_BLE_UART",
            "Connected to GATT server",
            "Notifications enabled",
            "Received: hello",
            "Received: world",
            "Received: !",
            "Disconnected (link lost)",
        ]
    );
}

// === User disconnect ===

#[tokio::test]
async fn test_user_disconnect_from_ready() {
    let (transport, session) = ready_session().await;
    let mut rx = session.subscribe();

    session.disconnect().await.unwrap();

    assert_cleared(&session);
    assert_eq!(transport.disconnect_calls(), 1);
    let events = drain(&mut rx);
    assert_eq!(
        transitions(&events),
        vec![SessionState::Disconnecting, SessionState::Disconnected]
    );
    assert_eq!(
        notices(&events),
        vec![Notice::info("Disconnected from ESP32_BLE_UART")]
    );
    assert_eq!(
        log_lines(&session).last().map(String::as_str),
        Some("Disconnected (by request)")
    );

    // Nothing left to tear down.
    session.disconnect().await.unwrap();
    assert_eq!(transport.disconnect_calls(), 1);
}

#[tokio::test]
async fn test_link_event_while_disconnecting() {
    let (transport, session) = ready_session().await;
    transport.hold(Step::Disconnect);

    let disconnect = {
        let session = session.clone();
        tokio::spawn(async move { session.disconnect().await })
    };
    transport.reached(Step::Disconnect).await;
    assert_eq!(session.state(), SessionState::Disconnecting);

    // A second request while tearing down is a no-op.
    session.disconnect().await.unwrap();
    assert_eq!(transport.disconnect_calls(), 1);

    transport.drop_link();
    assert_cleared(&session);

    transport.release(Step::Disconnect);
    disconnect.await.unwrap().unwrap();
    assert_cleared(&session);
}

#[tokio::test]
async fn test_user_disconnect_times_out_without_event() {
    let transport = Arc::new(ScriptedTransport::new().with_silent_disconnect());
    let session = Session::new(
        transport.clone(),
        SessionConfig::default().with_disconnect_timeout(Duration::from_millis(50)),
    );
    session.connect().await.unwrap();

    session.disconnect().await.unwrap();

    assert_cleared(&session);
    assert_eq!(transport.disconnect_calls(), 1);
    assert!(session.connect().await.is_ok());
}

#[tokio::test]
async fn test_cancel_while_requesting() {
    let transport = Arc::new(ScriptedTransport::new());
    let session = session_on(&transport);
    transport.hold(Step::RequestPeripheral);

    let connect = {
        let session = session.clone();
        tokio::spawn(async move { session.connect().await })
    };
    transport.reached(Step::RequestPeripheral).await;

    session.disconnect().await.unwrap();
    assert_cleared(&session);

    transport.release(Step::RequestPeripheral);
    let err = connect.await.unwrap().unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert_cleared(&session);
    assert_eq!(transport.call_count(Step::ConnectGatt), 0);
    assert_eq!(
        log_lines(&session),
        vec!["Requesting BLE device...", "Disconnected (cancelled)"]
    );
}

#[tokio::test]
async fn test_cancel_while_connecting_closes_new_link() {
    let transport = Arc::new(ScriptedTransport::new());
    let session = session_on(&transport);
    transport.hold(Step::ConnectGatt);

    let connect = {
        let session = session.clone();
        tokio::spawn(async move { session.connect().await })
    };
    transport.reached(Step::ConnectGatt).await;
    assert_eq!(session.state(), SessionState::ConnectingGatt);

    session.disconnect().await.unwrap();
    transport.release(Step::ConnectGatt);
    let err = connect.await.unwrap().unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert_cleared(&session);
    assert_eq!(transport.disconnect_calls(), 1);
    assert!(!transport.is_linked());
}

#[tokio::test]
async fn test_cancel_while_subscribing() {
    let transport = Arc::new(ScriptedTransport::new());
    let session = session_on(&transport);
    transport.hold(Step::Subscribe);

    let connect = {
        let session = session.clone();
        tokio::spawn(async move { session.connect().await })
    };
    transport.reached(Step::Subscribe).await;

    session.disconnect().await.unwrap();
    assert_cleared(&session);
    assert_eq!(transport.disconnect_calls(), 1);

    transport.release(Step::Subscribe);
    let err = connect.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_cleared(&session);
    assert_eq!(transport.disconnect_calls(), 1);
}

// === Log policy and callbacks ===

#[tokio::test]
async fn test_log_survives_reconnect() {
    let (transport, session) = ready_session().await;
    transport.notify(UART_TX_UUID, b"first".to_vec());
    transport.drop_link();

    session.connect().await.unwrap();
    transport.notify(UART_TX_UUID, b"second".to_vec());

    let log = session.log();
    let texts: Vec<_> = log.frames().filter_map(Frame::text).collect();
    assert_eq!(texts, vec!["first", "second"]);
    assert_eq!(
        log.markers()
            .filter(|m| **m == Marker::Requesting)
            .count(),
        2
    );

    session.clear_log();
    assert!(session.log().is_empty());
    assert!(session.is_ready());
}

#[tokio::test]
async fn test_bounded_log() {
    let transport = Arc::new(ScriptedTransport::new());
    let session = Session::new(transport.clone(), SessionConfig::default().with_log_capacity(3));
    session.connect().await.unwrap();

    for payload in ["1", "2", "3"] {
        transport.notify(UART_TX_UUID, payload.as_bytes().to_vec());
    }

    let log = session.log();
    assert_eq!(log.len(), 3);
    assert_eq!(log.evicted(), 4);
    assert_eq!(log_lines(&session), vec!["Received: 1", "Received: 2", "Received: 3"]);
}

#[tokio::test]
async fn test_callbacks_receive_events() {
    let (transport, session) = ready_session().await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let frames = {
        let tx = tx.clone();
        session.on_frame(move |frame| {
            let _ = tx.send(format!("frame {}", frame));
        })
    };
    let states = {
        let tx = tx.clone();
        session.on_state_changed(move |from, to| {
            let _ = tx.send(format!("state {} -> {}", from, to));
        })
    };
    let _notices = session.on_notice(move |notice| {
        let _ = tx.send(format!("notice {}", notice.message));
    });

    transport.notify(UART_TX_UUID, b"hi".to_vec());
    transport.drop_link();

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(rx.recv().await.unwrap());
    }
    seen.sort();
    assert_eq!(
        seen,
        vec![
            "frame hi",
            "notice Connection to ESP32_BLE_UART lost",
            "state Ready -> Disconnected",
        ]
    );

    assert_ne!(frames.id(), states.id());
    frames.unregister();
    states.unregister();
}
