use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use loranet::activation::ActivationCoordinator;
use loranet::config::{NetworkConfig, TimingConfig};
use loranet::crypto::{self, Direction};
use loranet::dedup::Deduplicator;
use loranet::device::{AESKey, DevAddr, Frame};
use loranet::downlink::{DownlinkProvider, QueuedDownlink};
use loranet::error::RoutingError;
use loranet::lorawan::commands::{self, MacCommand};
use loranet::lorawan::mac::{self, JoinAcceptPayload, PhyPayload};
use loranet::lorawan::region::DataRate;
use loranet::message::UplinkMessage;
use loranet::store::{DeviceStore, MemoryStore, FRAME_HISTORY_LEN};
use loranet::uplink::UplinkResolver;

mod mock;

fn resolver_with(store: &Arc<MemoryStore>) -> Arc<UplinkResolver> {
    let store: Arc<dyn DeviceStore> = store.clone();
    Arc::new(UplinkResolver::new(store, TimingConfig::default()))
}

fn coordinator_with(store: &Arc<MemoryStore>) -> ActivationCoordinator {
    let store: Arc<dyn DeviceStore> = store.clone();
    ActivationCoordinator::new(store, NetworkConfig::default(), &TimingConfig::default())
}

async fn resolve_two_copies(
    resolver: &Arc<UplinkResolver>,
    first: UplinkMessage,
    second: UplinkMessage,
) -> UplinkMessage {
    let collector = {
        let resolver = Arc::clone(resolver);
        tokio::spawn(async move { resolver.handle_uplink(first).await })
    };
    // Let the collector open the window before contributing.
    sleep(Duration::from_millis(1)).await;
    let contributed = resolver.handle_uplink(second).await.expect("contributor");
    assert!(contributed.is_none(), "contributor must return empty");
    collector
        .await
        .expect("join")
        .expect("resolution")
        .expect("collector result")
}

#[tokio::test(start_paused = true)]
async fn dedup_returns_full_set_to_exactly_one_caller() {
    let dedup: Arc<Deduplicator<u32>> = Arc::new(Deduplicator::new(Duration::from_millis(50)));

    let collector = {
        let dedup = Arc::clone(&dedup);
        tokio::spawn(async move { dedup.deduplicate(b"frame", 1).await })
    };
    sleep(Duration::from_millis(1)).await;
    assert!(dedup.deduplicate(b"frame", 2).await.is_empty());
    assert!(dedup.deduplicate(b"frame", 3).await.is_empty());
    // A different key is its own collection.
    let other = dedup.deduplicate(b"other", 9).await;
    assert_eq!(other, vec![9]);

    assert_eq!(collector.await.expect("join"), vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn dedup_absorbs_stragglers_then_discards_the_key() {
    let dedup: Arc<Deduplicator<u32>> = Arc::new(Deduplicator::new(Duration::from_millis(50)));

    let collected = dedup.deduplicate(b"frame", 1).await;
    assert_eq!(collected, vec![1]);

    // Inside the second window: absorbed, not a new collection.
    sleep(Duration::from_millis(20)).await;
    assert!(dedup.deduplicate(b"frame", 2).await.is_empty());

    // After the second window: a fresh collection forms.
    sleep(Duration::from_millis(120)).await;
    assert_eq!(dedup.deduplicate(b"frame", 3).await, vec![3]);
}

#[tokio::test(start_paused = true)]
async fn uplink_pipeline_resolves_aggregates_and_answers() {
    let mut session = mock::session("app-1", "dev-1");
    session.fcnt_up = 9;
    let store = mock::store_with(&session).await;
    let resolver = resolver_with(&store);

    let payload = mock::uplink_payload(
        &session.nwk_skey,
        &session.app_skey,
        session.dev_addr,
        10,
        mock::fctrl(true, false, 0),
        &[0x02], // LinkCheckReq
        Some(1),
        b"temp",
    );
    let first = mock::uplink_message(
        payload.clone(),
        "EU_863_870",
        DataRate::SF7BW125,
        vec![mock::gateway("gw-a", 4.3)],
        vec![mock::option("rx1-a", 30)],
    );
    let second = mock::uplink_message(
        payload,
        "EU_863_870",
        DataRate::SF7BW125,
        vec![mock::gateway("gw-b", 1.0)],
        vec![mock::option("rx1-b", 10)],
    );

    let resolved = resolve_two_copies(&resolver, first, second).await;

    assert_eq!(resolved.gateways.len(), 2);
    assert_eq!(resolved.downlink_options.len(), 2);
    assert_eq!(resolved.app_id.as_deref(), Some("app-1"));
    assert_eq!(resolved.dev_id.as_deref(), Some("dev-1"));

    let response = resolved.response_template.expect("response template");
    assert_eq!(
        response.option.expect("chosen option").identifier,
        "rx1-b",
        "lowest-score option wins"
    );
    let frame = match mac::parse(&response.payload).expect("response parses") {
        PhyPayload::Data(frame) => frame,
        other => panic!("unexpected response: {other:?}"),
    };
    let answers =
        commands::parse_all(&frame.fhdr.f_opts, Direction::Down).expect("answer parses");
    assert_eq!(
        answers,
        vec![MacCommand::LinkCheckAns {
            margin: 11, // 4.3 - (-7.5) dB, truncated
            gateway_count: 2,
        }]
    );

    let stored = store.get("app-1", "dev-1").await.expect("session");
    assert_eq!(stored.fcnt_up, 10);
    assert_eq!(stored.fcnt_down, 1, "response consumed a downlink counter");
    assert!(stored.last_seen.is_some());

    let frames = store.get_frames("app-1", "dev-1").await.expect("history");
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].fcnt, 10);
    assert_eq!(frames[0].gateway_count, 2);
    assert!((frames[0].max_snr - 4.3).abs() < 1e-6);
}

#[tokio::test(start_paused = true)]
async fn uplink_frame_counter_policy() {
    let mut session = mock::session("app-1", "dev-1");
    session.options.uses_32bit_fcnt = false;
    session.fcnt_up = 5;
    let store = mock::store_with(&session).await;
    let resolver = resolver_with(&store);

    for (fcnt, expect_err) in [(5u32, false), (4, true), (20_001, true)] {
        let payload = mock::uplink_payload(
            &session.nwk_skey,
            &session.app_skey,
            session.dev_addr,
            fcnt,
            mock::fctrl(false, false, 0),
            &[],
            Some(1),
            b"x",
        );
        let message = mock::uplink_message(
            payload,
            "EU_863_870",
            DataRate::SF7BW125,
            vec![mock::gateway("gw-a", 2.0)],
            vec![],
        );
        let result = resolver.handle_uplink(message).await;
        if expect_err {
            assert!(
                matches!(result, Err(RoutingError::InvalidFrameCounter)),
                "fcnt {fcnt}: {result:?}"
            );
        } else {
            assert!(result.is_ok(), "fcnt {fcnt}: {result:?}");
        }
        // Let the dedup key expire between iterations of the same payload.
        sleep(Duration::from_secs(1)).await;
    }

    // Replays must not have advanced the stored counter.
    let stored = store.get("app-1", "dev-1").await.expect("session");
    assert_eq!(stored.fcnt_up, 5);
}

#[tokio::test(start_paused = true)]
async fn uplink_rejects_unknown_address_and_wrong_key() {
    let session = mock::session("app-1", "dev-1");
    let store = mock::store_with(&session).await;
    let resolver = resolver_with(&store);

    // Wrong key: a candidate exists but its MIC never validates.
    let payload = mock::uplink_payload(
        &AESKey::new([0xEE; 16]),
        &session.app_skey,
        session.dev_addr,
        1,
        mock::fctrl(false, false, 0),
        &[],
        Some(1),
        b"x",
    );
    let message = mock::uplink_message(
        payload,
        "EU_863_870",
        DataRate::SF7BW125,
        vec![mock::gateway("gw-a", 2.0)],
        vec![],
    );
    assert!(matches!(
        resolver.handle_uplink(message).await,
        Err(RoutingError::NoMatch)
    ));

    // Unknown address: no candidates at all.
    let payload = mock::uplink_payload(
        &session.nwk_skey,
        &session.app_skey,
        DevAddr::new([0x27, 0x00, 0x00, 0x01]),
        1,
        mock::fctrl(false, false, 0),
        &[],
        Some(1),
        b"x",
    );
    let message = mock::uplink_message(
        payload,
        "EU_863_870",
        DataRate::SF7BW125,
        vec![mock::gateway("gw-a", 2.0)],
        vec![],
    );
    assert!(matches!(
        resolver.handle_uplink(message).await,
        Err(RoutingError::NotFound)
    ));
}

#[tokio::test(start_paused = true)]
async fn adr_recommendation_rides_the_paired_downlink() {
    let mut session = mock::session("app-1", "dev-1");
    session.fcnt_up = 100;
    session.adr.band = Some("US_902_928".to_string());
    let store = mock::store_with(&session).await;

    // One short of a full history; the uplink under test completes it.
    for i in 0..(FRAME_HISTORY_LEN - 1) {
        store
            .push_frame(
                "app-1",
                "dev-1",
                Frame {
                    fcnt: 80 + i as u32,
                    max_snr: 6.0,
                    gateway_count: 1,
                },
            )
            .await
            .expect("seed frame");
    }

    let resolver = resolver_with(&store);
    let payload = mock::uplink_payload(
        &session.nwk_skey,
        &session.app_skey,
        session.dev_addr,
        101,
        mock::fctrl(true, true, 0),
        &[],
        Some(1),
        b"x",
    );
    let message = mock::uplink_message(
        payload,
        "US_902_928",
        DataRate::SF10BW125,
        vec![mock::gateway("gw-a", 6.0)],
        vec![mock::option("rx1", 10)],
    );

    let resolved = resolver.handle_uplink(message).await.expect("resolution");
    let response = resolved
        .expect("collector result")
        .response_template
        .expect("response");

    let frame = match mac::parse(&response.payload).expect("response parses") {
        PhyPayload::Data(frame) => frame,
        other => panic!("unexpected response: {other:?}"),
    };
    assert!(frame.fhdr.f_ctrl.ack, "AdrAckReq forces the ACK bit");

    let sent = commands::parse_all(&frame.fhdr.f_opts, Direction::Down).expect("parses");
    assert_eq!(
        sent,
        vec![MacCommand::LinkADRReq {
            data_rate: 2,     // SF8BW125: two 3 dB steps above SF10
            tx_power: 5,      // stays at the 20 dBm default
            ch_mask: 0xFFFF,
            ch_mask_cntl: 0,
            nb_trans: 1,
        }]
    );

    let stored = store.get("app-1", "dev-1").await.expect("session");
    assert_eq!(stored.adr.data_rate, Some(DataRate::SF8BW125));
    assert_eq!(stored.adr.tx_power, Some(20));
    assert!(stored.adr.expect_res, "answer is now outstanding");
}

#[tokio::test(start_paused = true)]
async fn adr_opt_out_clears_history_and_desired_settings() {
    let mut session = mock::session("app-1", "dev-1");
    session.fcnt_up = 3;
    session.adr.data_rate = Some(DataRate::SF9BW125);
    session.adr.tx_power = Some(14);
    let store = mock::store_with(&session).await;
    store
        .push_frame(
            "app-1",
            "dev-1",
            Frame {
                fcnt: 2,
                max_snr: 1.0,
                gateway_count: 1,
            },
        )
        .await
        .expect("seed frame");

    let resolver = resolver_with(&store);
    let payload = mock::uplink_payload(
        &session.nwk_skey,
        &session.app_skey,
        session.dev_addr,
        4,
        mock::fctrl(false, false, 0),
        &[],
        Some(1),
        b"x",
    );
    let message = mock::uplink_message(
        payload,
        "EU_863_870",
        DataRate::SF9BW125,
        vec![mock::gateway("gw-a", 1.0)],
        vec![],
    );
    resolver.handle_uplink(message).await.expect("resolution");

    let stored = store.get("app-1", "dev-1").await.expect("session");
    assert_eq!(stored.adr.data_rate, None);
    assert_eq!(stored.adr.tx_power, None);
    assert!(store
        .get_frames("app-1", "dev-1")
        .await
        .expect("history")
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn link_adr_answer_feeds_the_failure_counter() {
    let mut session = mock::session("app-1", "dev-1");
    session.fcnt_up = 7;
    session.adr.expect_res = true;
    session.adr.failed = 2;
    let store = mock::store_with(&session).await;
    let resolver = resolver_with(&store);

    // LinkADRAns with every ack set.
    let payload = mock::uplink_payload(
        &session.nwk_skey,
        &session.app_skey,
        session.dev_addr,
        8,
        mock::fctrl(true, false, 0),
        &[0x03, 0x07],
        None,
        &[],
    );
    let message = mock::uplink_message(
        payload,
        "EU_863_870",
        DataRate::SF9BW125,
        vec![mock::gateway("gw-a", 1.0)],
        vec![],
    );
    resolver.handle_uplink(message).await.expect("resolution");

    let stored = store.get("app-1", "dev-1").await.expect("session");
    assert!(!stored.adr.expect_res);
    assert_eq!(stored.adr.failed, 0);

    // A rejection increments instead.
    sleep(Duration::from_secs(1)).await;
    let payload = mock::uplink_payload(
        &stored.nwk_skey,
        &stored.app_skey,
        stored.dev_addr,
        9,
        mock::fctrl(true, false, 0),
        &[0x03, 0x06], // channel-mask nack
        None,
        &[],
    );
    let message = mock::uplink_message(
        payload,
        "EU_863_870",
        DataRate::SF9BW125,
        vec![mock::gateway("gw-a", 1.0)],
        vec![],
    );
    resolver.handle_uplink(message).await.expect("resolution");

    let stored = store.get("app-1", "dev-1").await.expect("session");
    assert_eq!(stored.adr.failed, 1);
}

struct OneShotQueue(QueuedDownlink);

#[async_trait::async_trait]
impl DownlinkProvider for OneShotQueue {
    async fn next_downlink(&self, _app_id: &str, _dev_id: &str) -> Option<QueuedDownlink> {
        Some(self.0.clone())
    }
}

#[tokio::test(start_paused = true)]
async fn queued_application_payload_rides_the_response() {
    let mut session = mock::session("app-1", "dev-1");
    session.fcnt_up = 1;
    let store = mock::store_with(&session).await;

    let store_dyn: Arc<dyn DeviceStore> = store.clone();
    let resolver = Arc::new(
        UplinkResolver::new(store_dyn, TimingConfig::default()).with_downlink_provider(Arc::new(
            OneShotQueue(QueuedDownlink {
                f_port: 7,
                payload: b"set-rate".to_vec(),
                confirmed: false,
            }),
        )),
    );

    let payload = mock::uplink_payload(
        &session.nwk_skey,
        &session.app_skey,
        session.dev_addr,
        2,
        mock::fctrl(false, false, 0),
        &[],
        Some(1),
        b"x",
    );
    let message = mock::uplink_message(
        payload,
        "EU_863_870",
        DataRate::SF7BW125,
        vec![mock::gateway("gw-a", 2.0)],
        vec![mock::option("rx1", 10)],
    );

    let resolved = resolver
        .handle_uplink(message)
        .await
        .expect("resolution")
        .expect("collector result");
    let response = resolved.response_template.expect("response");
    let frame = match mac::parse(&response.payload).expect("parses") {
        PhyPayload::Data(frame) => frame,
        other => panic!("unexpected response: {other:?}"),
    };
    assert_eq!(frame.f_port, Some(7));

    // The payload decrypts with the application session key.
    let plain = crypto::encrypt_payload(
        &session.app_skey,
        session.dev_addr,
        0,
        Direction::Down,
        &frame.frm_payload,
    );
    assert_eq!(&plain[..], b"set-rate");
}

#[tokio::test(start_paused = true)]
async fn frame_history_is_bounded_most_recent_first() {
    let store = MemoryStore::new();
    for i in 0..=FRAME_HISTORY_LEN as u32 {
        store
            .push_frame(
                "app-1",
                "dev-1",
                Frame {
                    fcnt: i,
                    max_snr: 0.0,
                    gateway_count: 1,
                },
            )
            .await
            .expect("push");
    }

    let frames = store.get_frames("app-1", "dev-1").await.expect("history");
    assert_eq!(frames.len(), FRAME_HISTORY_LEN);
    assert_eq!(frames[0].fcnt, FRAME_HISTORY_LEN as u32, "most recent first");
    assert_eq!(
        frames.last().expect("non-empty").fcnt,
        1,
        "oldest entry evicted"
    );
}

#[tokio::test(start_paused = true)]
async fn activation_allocates_derives_and_rejects_replays() {
    let mut device = mock::session("app-1", "dev-1");
    device.app_key = Some(AESKey::new(mock::APP_KEY));
    device.dev_addr = DevAddr::new([0; 4]);
    let store = mock::store_with(&device).await;
    let coordinator = coordinator_with(&store);

    let join = mock::join_request(
        &device.app_eui,
        &device.dev_eui,
        0x4242,
        &AESKey::new(mock::APP_KEY),
    );

    // Network-server phase: address allocation + join-accept template.
    let prepared = coordinator
        .prepare_activation(mock::activation_request(
            join.clone(),
            device.app_eui,
            device.dev_eui,
            None,
            true,
        ))
        .await
        .expect("prepare")
        .expect("collector result");
    let allocated = match &prepared.metadata {
        Some(loranet::message::ProtocolActivationMetadata::Lorawan(meta)) => {
            meta.dev_addr.expect("address allocated")
        }
        None => panic!("metadata dropped"),
    };
    let template = prepared.response_template.as_ref().expect("template");
    let template_accept =
        JoinAcceptPayload::parse_plain(&template.payload).expect("template parses");
    assert_eq!(template_accept.dev_addr, allocated);
    assert_eq!(template_accept.app_nonce, [0; 3], "nonce left to the handler");

    // Handler phase: validate, derive, persist, seal.
    let response = coordinator
        .activate(prepared)
        .await
        .expect("activate")
        .expect("collector result");
    let accept =
        JoinAcceptPayload::unseal(&AESKey::new(mock::APP_KEY), &response.payload).expect("unseal");
    assert_eq!(accept.dev_addr, allocated);
    assert_eq!(accept.net_id, [0x00, 0x00, 0x13]);
    assert_ne!(accept.app_nonce, [0; 3]);

    let stored = store.get("app-1", "dev-1").await.expect("session");
    assert_eq!(stored.dev_addr, allocated);
    assert!(stored.used_dev_nonces.contains(&0x4242));
    assert!(stored.used_app_nonces.contains(&accept.app_nonce));
    let (nwk, app) = crypto::derive_session_keys(
        &AESKey::new(mock::APP_KEY),
        &accept.app_nonce,
        &[0x00, 0x00, 0x13],
        0x4242,
    );
    assert_eq!(stored.nwk_skey, nwk);
    assert_eq!(stored.app_skey, app);

    // Same DevNonce again, past the dedup lifetime: replay.
    sleep(Duration::from_secs(3)).await;
    let replay = coordinator
        .activate(mock::activation_request(
            join,
            device.app_eui,
            device.dev_eui,
            Some(allocated),
            true,
        ))
        .await;
    assert!(matches!(replay, Err(RoutingError::AlreadyUsed)));

    // Network-server finalize: counters reset, activation stamped.
    coordinator
        .finalize("app-1", "dev-1", allocated, nwk, app)
        .await
        .expect("finalize");
    let finalized = store.get("app-1", "dev-1").await.expect("session");
    assert_eq!(finalized.fcnt_up, 0);
    assert_eq!(finalized.fcnt_down, 0);
    assert!(finalized.activated_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn activation_falls_back_to_the_application_key() {
    let store = Arc::new(MemoryStore::new());
    store.set_app_key([0xA1; 8], AESKey::new(mock::APP_KEY));
    let coordinator = coordinator_with(&store);

    let join = mock::join_request(&[0xA1; 8], &[0xD1; 8], 0x0001, &AESKey::new(mock::APP_KEY));
    let response = coordinator
        .activate(mock::activation_request(
            join,
            [0xA1; 8],
            [0xD1; 8],
            Some(DevAddr::new([0x26, 0, 0, 9])),
            true,
        ))
        .await
        .expect("activate")
        .expect("collector result");
    assert!(!response.payload.is_empty());

    // The session was created under the hex identity.
    let stored = store
        .get("a1a1a1a1a1a1a1a1", "d1d1d1d1d1d1d1d1")
        .await
        .expect("session");
    assert!(stored.used_dev_nonces.contains(&0x0001));
}

#[tokio::test(start_paused = true)]
async fn activation_validation_failures() {
    let mut device = mock::session("app-1", "dev-1");
    device.app_key = Some(AESKey::new(mock::APP_KEY));
    let store = mock::store_with(&device).await;
    let coordinator = coordinator_with(&store);

    // Join signed with the wrong key.
    let forged = mock::join_request(
        &device.app_eui,
        &device.dev_eui,
        0x0002,
        &AESKey::new([0x66; 16]),
    );
    let result = coordinator
        .activate(mock::activation_request(
            forged,
            device.app_eui,
            device.dev_eui,
            Some(DevAddr::new([0x26, 0, 0, 9])),
            true,
        ))
        .await;
    assert!(matches!(result, Err(RoutingError::NoMatch)));

    // Missing activation metadata.
    let join = mock::join_request(
        &device.app_eui,
        &device.dev_eui,
        0x0003,
        &AESKey::new(mock::APP_KEY),
    );
    let mut request = mock::activation_request(
        join.clone(),
        device.app_eui,
        device.dev_eui,
        Some(DevAddr::new([0x26, 0, 0, 9])),
        true,
    );
    request.metadata = None;
    assert!(matches!(
        coordinator.activate(request).await,
        Err(RoutingError::InvalidArgument(_))
    ));

    // Metadata present but no address allocated.
    sleep(Duration::from_secs(3)).await;
    let request = mock::activation_request(join, device.app_eui, device.dev_eui, None, true);
    assert!(matches!(
        coordinator.activate(request).await,
        Err(RoutingError::InvalidArgument(_))
    ));

    // Unknown identity with no application key on file.
    let orphan = mock::join_request(&[0xBB; 8], &[0xBC; 8], 0x0004, &AESKey::new(mock::APP_KEY));
    let request = mock::activation_request(
        orphan,
        [0xBB; 8],
        [0xBC; 8],
        Some(DevAddr::new([0x26, 0, 0, 9])),
        true,
    );
    assert!(matches!(
        coordinator.activate(request).await,
        Err(RoutingError::NotFound)
    ));
}

#[tokio::test(start_paused = true)]
async fn prepare_passes_through_when_no_response_is_expected() {
    let mut device = mock::session("app-1", "dev-1");
    device.app_key = Some(AESKey::new(mock::APP_KEY));
    let store = mock::store_with(&device).await;
    let coordinator = coordinator_with(&store);

    let join = mock::join_request(
        &device.app_eui,
        &device.dev_eui,
        0x0005,
        &AESKey::new(mock::APP_KEY),
    );
    let prepared = coordinator
        .prepare_activation(mock::activation_request(
            join,
            device.app_eui,
            device.dev_eui,
            None,
            false,
        ))
        .await
        .expect("prepare")
        .expect("collector result");

    match &prepared.metadata {
        Some(loranet::message::ProtocolActivationMetadata::Lorawan(meta)) => {
            assert_eq!(meta.dev_addr, None, "no allocation without a response path");
        }
        None => panic!("metadata dropped"),
    }
    assert!(prepared.response_template.is_none());
}
