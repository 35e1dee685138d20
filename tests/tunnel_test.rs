//! End-to-end connection scenarios against the mock transport.
//!
//! Every test runs under paused tokio time, so the protocol timers (50 ms
//! pacing, 1 s ACK retry, 10 s heartbeat window, 45 s heartbeat period) fire
//! deterministically and the scenarios complete instantly.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use knx_link::net::{mock_pair, MockHandle, MockProvider};
use knx_link::protocol::constants::{
    CemiMessageCode, ServiceType, E_NO_ERROR, E_NO_MORE_CONNECTIONS,
};
use knx_link::protocol::{
    Apci, Apdu, ApduPayload, Body, CemiFrame, ConnState, ConnectionHeader, Crd, DeviceInfoDib,
    Frame, Hpai,
};
use knx_link::{GroupAddress, IndividualAddress, KnxClient, KnxError, KnxEvent};

const GATEWAY: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 3671);
const MULTICAST: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(224, 0, 23, 12), 3671);
const CHANNEL: u8 = 7;

fn ga(s: &str) -> GroupAddress {
    s.parse().unwrap()
}

fn ia(s: &str) -> IndividualAddress {
    s.parse().unwrap()
}

fn device_info(phys: &str) -> DeviceInfoDib {
    let mut name = [0u8; 30];
    name[..8].copy_from_slice(b"KNX/IP-R");
    DeviceInfoDib {
        knx_medium: 0x02,
        device_status: 0,
        individual_addr: ia(phys),
        project_installation_id: 0,
        serial_number: [0, 1, 2, 3, 4, 5],
        routing_multicast: Ipv4Addr::new(224, 0, 23, 12),
        mac_address: [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF],
        friendly_name: name,
    }
}

fn search_response(phys: &str, endpoint: SocketAddrV4) -> Vec<u8> {
    Frame::new(Body::SearchResponse {
        control: Hpai::new(endpoint),
        device_info: device_info(phys),
    })
    .encode()
    .unwrap()
}

fn connect_response(channel: u8, status: u8) -> Vec<u8> {
    let body = if status == E_NO_ERROR {
        Body::ConnectResponse {
            state: ConnState::new(channel, status),
            data_endpoint: Some(Hpai::new(GATEWAY)),
            crd: Some(Crd {
                connection_type: 0x04,
                assigned_addr: ia("1.1.250"),
            }),
        }
    } else {
        Body::ConnectResponse {
            state: ConnState::new(channel, status),
            data_endpoint: None,
            crd: None,
        }
    };
    Frame::new(body).encode().unwrap()
}

fn tunneling_ack(channel: u8, sequence: u8, status: u8) -> Vec<u8> {
    Frame::new(Body::TunnelingAck {
        header: ConnectionHeader::new(channel, sequence, status),
    })
    .encode()
    .unwrap()
}

fn connectionstate_response(channel: u8, status: u8) -> Vec<u8> {
    Frame::new(Body::ConnectionstateResponse {
        state: ConnState::new(channel, status),
    })
    .encode()
    .unwrap()
}

fn inbound_ldata(
    channel: u8,
    sequence: u8,
    src: &str,
    dest: &str,
    apci: Apci,
    payload: ApduPayload,
) -> Vec<u8> {
    let mut cemi = CemiFrame::ldata_ind(ia(src));
    cemi.destination = ga(dest).raw();
    cemi.apdu = Some(Apdu {
        tpci: 0,
        apci,
        payload,
    });
    Frame::new(Body::TunnelingRequest {
        header: ConnectionHeader::new(channel, sequence, 0),
        cemi,
    })
    .encode()
    .unwrap()
}

fn parse(data: &[u8]) -> Frame {
    Frame::parse(data).unwrap()
}

/// Bring a client online against a preconfigured gateway endpoint. Returns
/// the client, the control-socket handle and an event receiver with the
/// initial `Online` event already consumed.
async fn online_client() -> (KnxClient, MockHandle, tokio::sync::broadcast::Receiver<KnxEvent>) {
    let (control, mut handle) = mock_pair();
    let mut provider = MockProvider::new();
    provider.push(control);

    let client = KnxClient::builder()
        .gateway(GATEWAY)
        .build_with(provider);
    let mut events = client.subscribe();

    let connector = client.clone();
    let task = tokio::spawn(async move { connector.connect().await });

    let sent = handle.next_sent().await;
    assert_eq!(parse(&sent.data).service_type(), ServiceType::ConnectRequest);
    assert_eq!(sent.to, GATEWAY);
    handle.inject(connect_response(CHANNEL, E_NO_ERROR), GATEWAY);

    task.await.unwrap().unwrap();
    assert_eq!(events.recv().await.unwrap(), KnxEvent::Online);
    (client, handle, events)
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

// -- Scenario 1: discovery to connected ------------------------------------

#[tokio::test(start_paused = true)]
async fn discovery_to_connected() {
    let (discovery, mut d_handle) = mock_pair();
    let (control, mut c_handle) = mock_pair();
    let mut provider = MockProvider::new();
    provider.push(discovery);
    provider.push(control);

    let client = KnxClient::builder().build_with(provider);
    let mut events = client.subscribe();

    let connector = client.clone();
    let task = tokio::spawn(async move { connector.connect().await });

    // SEARCH_REQUEST goes to the multicast group.
    let sent = d_handle.next_sent().await;
    assert_eq!(sent.to, MULTICAST);
    assert_eq!(parse(&sent.data).service_type(), ServiceType::SearchRequest);

    // The advertised gateway answers; CONNECT_REQUEST follows to its
    // control endpoint.
    d_handle.inject(search_response("1.1.220", GATEWAY), GATEWAY);
    let sent = c_handle.next_sent().await;
    assert_eq!(sent.to, GATEWAY);
    assert_eq!(parse(&sent.data).service_type(), ServiceType::ConnectRequest);

    c_handle.inject(connect_response(CHANNEL, E_NO_ERROR), GATEWAY);
    task.await.unwrap().unwrap();
    assert_eq!(events.recv().await.unwrap(), KnxEvent::Online);
}

#[tokio::test(start_paused = true)]
async fn discovery_filter_skips_foreign_gateways() {
    let other_endpoint = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 99), 3671);
    let (discovery, mut d_handle) = mock_pair();
    let (control, mut c_handle) = mock_pair();
    let mut provider = MockProvider::new();
    provider.push(discovery);
    provider.push(control);

    let client = KnxClient::builder().build_with(provider);
    let connector = client.clone();
    let task = tokio::spawn(async move { connector.connect().await });

    d_handle.next_sent().await; // SEARCH_REQUEST

    // A gateway with the wrong physical address answers first and must be
    // ignored; the filtered one wins.
    d_handle.inject(search_response("1.0.0", other_endpoint), other_endpoint);
    d_handle.inject(search_response("1.1.220", GATEWAY), GATEWAY);

    let sent = c_handle.next_sent().await;
    assert_eq!(sent.to, GATEWAY);

    c_handle.inject(connect_response(CHANNEL, E_NO_ERROR), GATEWAY);
    task.await.unwrap().unwrap();
}

// -- Scenario 2: paced write ------------------------------------------------

#[tokio::test(start_paused = true)]
async fn write_roundtrip_and_pacing() {
    let (client, mut handle, _events) = online_client().await;

    let writer = client.clone();
    let first_write =
        tokio::spawn(async move { writer.write(ga("1/2/3"), ApduPayload::Small(1)).await });

    // First request goes out with sequence 0 and the expected cEMI shape.
    let first = handle.next_sent().await;
    let frame = parse(&first.data);
    let Body::TunnelingRequest { header, cemi } = &frame.body else {
        panic!("expected tunneling request, got {frame:?}");
    };
    assert_eq!(header.channel_id, CHANNEL);
    assert_eq!(header.sequence, 0);
    assert_eq!(cemi.msg_code, CemiMessageCode::LDataReq);
    assert!(cemi.ctrl2.is_group_address());
    assert_eq!(cemi.destination_group(), Some(ga("1/2/3")));
    let apdu = cemi.apdu.as_ref().unwrap();
    assert_eq!(apdu.apci, Apci::GroupValueWrite);
    assert_eq!(apdu.payload, ApduPayload::Small(1));

    // Queue a second write while the first is still in flight.
    let writer = client.clone();
    let second_write =
        tokio::spawn(async move { writer.write(ga("1/2/4"), ApduPayload::Small(0)).await });
    settle().await;

    handle.inject(tunneling_ack(CHANNEL, 0, E_NO_ERROR), GATEWAY);
    first_write.await.unwrap().unwrap();

    // The second request must wait out the 50 ms pacing window and then
    // carry the incremented sequence number.
    let second = handle.next_sent().await;
    assert!(second.at - first.at >= Duration::from_millis(50));
    let Body::TunnelingRequest { header, .. } = parse(&second.data).body else {
        panic!("expected tunneling request");
    };
    assert_eq!(header.sequence, 1);

    handle.inject(tunneling_ack(CHANNEL, 1, E_NO_ERROR), GATEWAY);
    second_write.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn ack_with_wrong_channel_is_dropped() {
    let (client, mut handle, _events) = online_client().await;

    let writer = client.clone();
    let write = tokio::spawn(async move { writer.write(ga("1/2/3"), ApduPayload::Small(1)).await });

    let first = handle.next_sent().await;

    // An ACK for someone else's channel must not complete the exchange;
    // the 1 s timer then retransmits the identical bytes.
    handle.inject(tunneling_ack(CHANNEL + 1, 0, E_NO_ERROR), GATEWAY);
    let retransmit = handle.next_sent().await;
    assert_eq!(retransmit.data, first.data);
    assert!(retransmit.at - first.at >= Duration::from_secs(1));

    handle.inject(tunneling_ack(CHANNEL, 0, E_NO_ERROR), GATEWAY);
    write.await.unwrap().unwrap();
}

// -- Scenario 3: ACK timeout, retransmit, disconnect ------------------------

#[tokio::test(start_paused = true)]
async fn ack_timeout_retransmits_then_disconnects() {
    let (client, mut handle, mut events) = online_client().await;

    let writer = client.clone();
    let write = tokio::spawn(async move { writer.write(ga("1/2/3"), ApduPayload::Small(1)).await });

    let first = handle.next_sent().await;
    assert_eq!(
        parse(&first.data).service_type(),
        ServiceType::TunnelingRequest
    );

    // No ACK: after one second the same bytes go out again.
    let retransmit = handle.next_sent().await;
    assert_eq!(retransmit.data, first.data);
    assert!(retransmit.at - first.at >= Duration::from_secs(1));

    // Still no ACK: the tunnel gives up and tears down.
    let teardown = handle.next_sent().await;
    assert_eq!(
        parse(&teardown.data).service_type(),
        ServiceType::DisconnectRequest
    );

    let result = write.await.unwrap();
    assert!(matches!(result, Err(KnxError::NoResponse)));

    // Idle follows the disconnect exchange.
    handle.inject(
        Frame::new(Body::DisconnectResponse {
            state: ConnState::new(CHANNEL, 0),
        })
        .encode()
        .unwrap(),
        GATEWAY,
    );
    loop {
        if events.recv().await.unwrap() == KnxEvent::Offline {
            break;
        }
    }
}

// -- Scenario 4: heartbeat loss ---------------------------------------------

#[tokio::test(start_paused = true)]
async fn heartbeat_failure_streak_disconnects() {
    let (_client, mut handle, _events) = online_client().await;
    let online_at = tokio::time::Instant::now();

    // First heartbeat fires after the 45 s period, the three retries after
    // each 10 s response window.
    for attempt in 0..4 {
        let sent = handle.next_sent().await;
        assert_eq!(
            parse(&sent.data).service_type(),
            ServiceType::ConnectionstateRequest,
            "heartbeat attempt {attempt}"
        );
        if attempt == 0 {
            assert!(sent.at - online_at >= Duration::from_secs(45));
        }
    }

    // Fourth failure exceeds the streak limit.
    let teardown = handle.next_sent().await;
    assert_eq!(
        parse(&teardown.data).service_type(),
        ServiceType::DisconnectRequest
    );
}

#[tokio::test(start_paused = true)]
async fn heartbeat_answer_resets_the_streak() {
    let (client, mut handle, _events) = online_client().await;

    // Miss three windows, then answer; the tunnel must stay up.
    for _ in 0..4 {
        let sent = handle.next_sent().await;
        assert_eq!(
            parse(&sent.data).service_type(),
            ServiceType::ConnectionstateRequest
        );
    }
    handle.inject(connectionstate_response(CHANNEL, E_NO_ERROR), GATEWAY);
    settle().await;

    // Still online: a write goes straight out.
    let writer = client.clone();
    let write = tokio::spawn(async move { writer.write(ga("1/2/3"), ApduPayload::Small(1)).await });
    let sent = handle.next_sent().await;
    assert_eq!(
        parse(&sent.data).service_type(),
        ServiceType::TunnelingRequest
    );
    handle.inject(tunneling_ack(CHANNEL, 0, E_NO_ERROR), GATEWAY);
    write.await.unwrap().unwrap();
}

// -- Scenario 5 and 6: inbound events, duplicate suppression ----------------

#[tokio::test(start_paused = true)]
async fn inbound_group_event_is_acked_and_emitted() {
    let (_client, mut handle, mut events) = online_client().await;

    handle.inject(
        inbound_ldata(
            CHANNEL,
            0,
            "1.1.1",
            "0/1/2",
            Apci::GroupValueWrite,
            ApduPayload::Bytes(vec![0x42]),
        ),
        GATEWAY,
    );

    // The ACK echoes the sequence number.
    let sent = handle.next_sent().await;
    let Body::TunnelingAck { header } = parse(&sent.data).body else {
        panic!("expected tunneling ack");
    };
    assert_eq!(header.channel_id, CHANNEL);
    assert_eq!(header.sequence, 0);
    assert_eq!(header.status, E_NO_ERROR);

    assert_eq!(
        events.recv().await.unwrap(),
        KnxEvent::GroupValue {
            apci: Apci::GroupValueWrite,
            src: ia("1.1.1"),
            dest: ga("0/1/2"),
            payload: vec![0x42],
        }
    );
}

#[tokio::test(start_paused = true)]
async fn duplicate_inbound_is_acked_but_not_redelivered() {
    let (_client, mut handle, mut events) = online_client().await;

    let telegram = inbound_ldata(
        CHANNEL,
        0,
        "1.1.1",
        "0/1/2",
        Apci::GroupValueWrite,
        ApduPayload::Bytes(vec![0x42]),
    );

    handle.inject(telegram.clone(), GATEWAY);
    handle.next_sent().await; // first ACK
    assert!(matches!(
        events.recv().await.unwrap(),
        KnxEvent::GroupValue { .. }
    ));

    // Replay of sequence 0: ACK again, no second event.
    handle.inject(telegram, GATEWAY);
    let sent = handle.next_sent().await;
    let Body::TunnelingAck { header } = parse(&sent.data).body else {
        panic!("expected tunneling ack");
    };
    assert_eq!(header.sequence, 0);
    settle().await;
    assert!(events.try_recv().is_err());

    // The expected counter advanced exactly once: sequence 1 is delivered.
    handle.inject(
        inbound_ldata(
            CHANNEL,
            1,
            "1.1.1",
            "0/1/2",
            Apci::GroupValueWrite,
            ApduPayload::Bytes(vec![0x43]),
        ),
        GATEWAY,
    );
    handle.next_sent().await;
    assert!(matches!(
        events.recv().await.unwrap(),
        KnxEvent::GroupValue { payload, .. } if payload == vec![0x43]
    ));
}

#[tokio::test(start_paused = true)]
async fn out_of_window_inbound_gets_no_ack_and_no_event() {
    let (_client, mut handle, mut events) = online_client().await;

    handle.inject(
        inbound_ldata(
            CHANNEL,
            5,
            "1.1.1",
            "0/1/2",
            Apci::GroupValueWrite,
            ApduPayload::Bytes(vec![0x42]),
        ),
        GATEWAY,
    );
    settle().await;

    assert!(handle.try_sent().is_none());
    assert!(events.try_recv().is_err());
}

// -- Read correlation --------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn read_resolves_on_group_response() {
    let (client, mut handle, _events) = online_client().await;

    let reader = client.clone();
    let read = tokio::spawn(async move { reader.read(ga("0/0/5")).await });

    let sent = handle.next_sent().await;
    let Body::TunnelingRequest { header, cemi } = parse(&sent.data).body else {
        panic!("expected tunneling request");
    };
    assert_eq!(cemi.apdu.as_ref().unwrap().apci, Apci::GroupValueRead);

    handle.inject(tunneling_ack(CHANNEL, header.sequence, E_NO_ERROR), GATEWAY);

    // The answering device reports the value.
    handle.inject(
        inbound_ldata(
            CHANNEL,
            0,
            "1.1.5",
            "0/0/5",
            Apci::GroupValueResponse,
            ApduPayload::Bytes(vec![0x2A]),
        ),
        GATEWAY,
    );
    handle.next_sent().await; // ACK for the inbound frame

    assert_eq!(read.await.unwrap().unwrap(), vec![0x2A]);
}

// -- Connect refusals ---------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn no_more_connections_backs_off_and_retries() {
    let (control1, mut h1) = mock_pair();
    let (control2, mut h2) = mock_pair();
    let mut provider = MockProvider::new();
    provider.push(control1);
    provider.push(control2);

    let client = KnxClient::builder().gateway(GATEWAY).build_with(provider);
    let connector = client.clone();
    let task = tokio::spawn(async move { connector.connect().await });

    // First attempt is refused: back to idle, not connected.
    h1.next_sent().await;
    h1.inject(connect_response(0, E_NO_MORE_CONNECTIONS), GATEWAY);

    // The 2 s idle retry opens a fresh control socket and tries again.
    let sent = h2.next_sent().await;
    assert_eq!(parse(&sent.data).service_type(), ServiceType::ConnectRequest);
    h2.inject(connect_response(CHANNEL, E_NO_ERROR), GATEWAY);

    task.await.unwrap().unwrap();
}
