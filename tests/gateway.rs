mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

use common::{builder, eventually, FakeGateway, BOT_ID};
use shardline::config::ReconnectConfig;
use shardline::gateway::SessionState;
use shardline::prelude::*;

const WAIT: Duration = Duration::from_secs(5);

fn idle_hello() -> UpdateStatusPayload {
    UpdateStatusPayload::new(Status::Idle).activity(Activity::playing("hello"))
}

fn quick_retries() -> ReconnectConfig {
    ReconnectConfig {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        ..ReconnectConfig::default()
    }
}

fn all_connected(client: &Client) -> bool {
    let states = client.shard_states();
    !states.is_empty() && states.iter().all(|(_, s)| *s == SessionState::Connected)
}

#[tokio::test]
async fn emit_before_connect_is_rejected() {
    let gateway = FakeGateway::new();
    let client = builder(&gateway, "token-premature").build().unwrap();

    let result = client.emit(GatewayCommand::UpdateStatus(idle_hello())).await;
    assert!(matches!(result, Err(ClientError::NotConnected)));
    assert!(gateway.commands(3).is_empty());
}

#[tokio::test]
async fn connect_fires_ready_once() {
    let gateway = FakeGateway::new();
    let client = builder(&gateway, "token-ready")
        .shards(vec![0, 1], 2)
        .build()
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    client.ready(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    timeout(WAIT, client.connect()).await.unwrap().unwrap();
    assert!(eventually(WAIT, || calls.load(Ordering::SeqCst) == 1).await);
    assert!(client.is_ready());
    assert_eq!(client.shard_count(), 2);
    assert!(client
        .shard_states()
        .iter()
        .all(|(_, state)| *state == SessionState::Connected));

    assert!(matches!(
        client.connect().await,
        Err(ClientError::AlreadyConnected)
    ));

    // subscribing late still runs, exactly once
    let late = Arc::new(AtomicUsize::new(0));
    let counter = late.clone();
    client.ready(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(late.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn presence_is_mirrored_back() {
    let gateway = FakeGateway::new();
    let client = builder(&gateway, "token-presence").build().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on(EventKind::PresenceUpdate, move |_ctx, event| {
        let tx = tx.clone();
        async move {
            if let Event::PresenceUpdate(presence) = &*event {
                let _ = tx.send((**presence).clone());
            }
        }
    });

    timeout(WAIT, client.connect()).await.unwrap().unwrap();
    let ack = client
        .emit(GatewayCommand::UpdateStatus(idle_hello()))
        .await
        .unwrap();
    assert_eq!(ack.shards, vec![0]);

    let presence = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    let me = client.current_user().await.unwrap();
    assert_eq!(presence.user.id, me.id);
    assert_eq!(me.id, Snowflake::new(BOT_ID));
    assert_eq!(presence.status, Status::Idle);
    assert_eq!(presence.game().map(|g| g.name.as_str()), Some("hello"));

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn connecting_twice_at_once_is_rejected() {
    let gateway = FakeGateway::new();
    gateway.hold_ready(true);
    let client = builder(&gateway, "token-twice").build().unwrap();

    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    assert!(eventually(WAIT, || !gateway.identifies().is_empty()).await);

    assert!(matches!(
        client.connect().await,
        Err(ClientError::AlreadyConnecting)
    ));

    client.disconnect().await.unwrap();
    let first = timeout(WAIT, first).await.unwrap().unwrap();
    assert!(matches!(first, Err(ClientError::Cancelled)));
}

#[tokio::test]
async fn identifies_are_paced() {
    let gateway = FakeGateway::new();
    let interval = Duration::from_millis(120);
    let client = builder(&gateway, "token-paced")
        .shards(Vec::new(), 3)
        .identify_interval(interval)
        .build()
        .unwrap();

    timeout(WAIT, client.connect()).await.unwrap().unwrap();

    let identifies = gateway.identifies();
    let shards: Vec<u32> = identifies.iter().map(|i| i.shard[0]).collect();
    assert_eq!(shards, vec![0, 1, 2]);
    for pair in identifies.windows(2) {
        let gap = pair[1].at.duration_since(pair[0].at);
        assert!(gap >= interval - Duration::from_millis(5), "gap {gap:?}");
    }

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn two_clients_split_the_shards() {
    let gateway = FakeGateway::new();
    let interval = Duration::from_millis(100);
    let first = builder(&gateway, "token-split")
        .shards(vec![0], 2)
        .identify_interval(interval)
        .build()
        .unwrap();
    let second = builder(&gateway, "token-split")
        .shards(vec![1], 2)
        .identify_interval(interval)
        .build()
        .unwrap();

    let (a, b) = tokio::join!(
        timeout(WAIT, first.connect()),
        timeout(WAIT, second.connect())
    );
    a.unwrap().unwrap();
    b.unwrap().unwrap();

    let identifies = gateway.identifies();
    let mut shards: Vec<[u32; 2]> = identifies.iter().map(|i| i.shard).collect();
    shards.sort();
    assert_eq!(shards, vec![[0, 2], [1, 2]]);

    // same token, same limiter
    let gap = identifies[1].at.duration_since(identifies[0].at);
    assert!(gap >= interval - Duration::from_millis(5), "gap {gap:?}");

    assert_eq!(first.shard_states().len(), 1);
    assert_eq!(second.shard_states()[0].0, 1);

    first.disconnect().await.unwrap();
    second.disconnect().await.unwrap();
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let gateway = FakeGateway::new();
    let client = builder(&gateway, "token-disconnect").build().unwrap();

    assert_ok!(client.disconnect().await);
    assert_ok!(client.disconnect().await);

    assert_ok!(timeout(WAIT, client.connect()).await.unwrap());
    let connections = gateway.connections();
    assert_ok!(client.disconnect().await);
    assert_ok!(client.disconnect().await);
    assert_eq!(gateway.connections(), connections);

    assert!(client.shard_states().is_empty());
    let err = assert_err!(client.emit(GatewayCommand::UpdateStatus(idle_hello())).await);
    assert!(matches!(err, ClientError::NotConnected));
}

#[tokio::test]
async fn abandoned_connect_can_be_retried() {
    let gateway = FakeGateway::new();
    gateway.hold_ready(true);
    let client = builder(&gateway, "token-abandon").build().unwrap();

    assert!(timeout(Duration::from_millis(200), client.connect())
        .await
        .is_err());

    gateway.hold_ready(false);
    timeout(WAIT, client.connect()).await.unwrap().unwrap();
    assert!(eventually(WAIT, || client.is_ready()).await);
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn emitted_presence_is_used_for_later_identifies() {
    let gateway = FakeGateway::new();
    let client = builder(&gateway, "token-identify-presence")
        .presence(UpdateStatusPayload::new(Status::Dnd))
        .build()
        .unwrap();

    timeout(WAIT, client.connect()).await.unwrap().unwrap();
    assert_eq!(
        gateway.identifies()[0].presence.as_ref().unwrap()["status"],
        "dnd"
    );

    client
        .emit(GatewayCommand::UpdateStatus(idle_hello()))
        .await
        .unwrap();
    client.disconnect().await.unwrap();

    timeout(WAIT, client.connect()).await.unwrap().unwrap();
    let identifies = gateway.identifies();
    let presence = identifies.last().unwrap().presence.as_ref().unwrap();
    assert_eq!(presence["status"], "idle");
    assert_eq!(presence["activities"][0]["name"], "hello");
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn ignored_events_skip_handlers() {
    let gateway = FakeGateway::new();
    let client = builder(&gateway, "token-ignored")
        .ignore_event(EventKind::PresenceUpdate)
        .build()
        .unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    client.on(EventKind::PresenceUpdate, move |_ctx, _event| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    timeout(WAIT, client.connect()).await.unwrap().unwrap();
    client
        .emit(GatewayCommand::UpdateStatus(idle_hello()))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 0);
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn guild_commands_go_to_the_owning_shard() {
    let gateway = FakeGateway::new();
    let client = builder(&gateway, "token-routing")
        .shards(vec![0], 2)
        .build()
        .unwrap();
    timeout(WAIT, client.connect()).await.unwrap().unwrap();

    // (id >> 22) % 2 == 1
    let foreign = Snowflake::new(1 << 22);
    let request = RequestGuildMembersPayload {
        guild_id: foreign,
        query: Some(String::new()),
        limit: 0,
        presences: None,
        user_ids: Vec::new(),
        nonce: None,
    };
    assert!(matches!(
        client
            .emit(GatewayCommand::RequestGuildMembers(request.clone()))
            .await,
        Err(ClientError::ShardNotOwned { shard_id: 1, .. })
    ));

    let own = RequestGuildMembersPayload {
        guild_id: Snowflake::new(2 << 22),
        ..request
    };
    let ack = client
        .emit(GatewayCommand::RequestGuildMembers(own))
        .await
        .unwrap();
    assert_eq!(ack.shards, vec![0]);
    assert_eq!(gateway.commands(8).len(), 1);

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn sockets_open_only_once_identify_may_go_out() {
    let gateway = FakeGateway::new();
    gateway.heartbeat_interval(100);
    let interval = Duration::from_millis(400);
    let client = builder(&gateway, "token-queue-first")
        .shards(Vec::new(), 2)
        .identify_interval(interval)
        .build()
        .unwrap();

    timeout(WAIT, client.connect()).await.unwrap().unwrap();

    let identifies = gateway.identifies();
    assert_eq!(identifies.len(), 2);
    let gap = identifies[1].at.duration_since(identifies[0].at);
    assert!(gap >= interval - Duration::from_millis(5), "gap {gap:?}");
    for identify in &identifies {
        let idle = identify.at.duration_since(identify.opened);
        assert!(idle < Duration::from_millis(100), "socket idle for {idle:?}");
    }

    // both shards keep beating at the interval HELLO asked for
    let before = gateway.heartbeats();
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(gateway.heartbeats() >= before + 4);
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn dropped_connection_resumes_the_session() {
    let gateway = FakeGateway::new();
    let client = builder(&gateway, "token-resume")
        .reconnect_config(quick_retries())
        .build()
        .unwrap();

    let ready = Arc::new(AtomicUsize::new(0));
    let counter = ready.clone();
    client.ready(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    timeout(WAIT, client.connect()).await.unwrap().unwrap();
    // READY is sequence 1, the mirrored presence 2
    client
        .emit(GatewayCommand::UpdateStatus(idle_hello()))
        .await
        .unwrap();

    gateway.drop_connections(None);
    assert!(eventually(WAIT, || !gateway.commands(6).is_empty() && all_connected(&client)).await);

    let resume = &gateway.commands(6)[0]["d"];
    assert_eq!(resume["session_id"], "session-0");
    assert_eq!(resume["seq"], 2);
    assert_eq!(gateway.identifies().len(), 1);
    assert_eq!(gateway.connections(), 2);
    assert_eq!(ready.load(Ordering::SeqCst), 1);

    // commands flow again on the resumed session
    client
        .emit(GatewayCommand::UpdateStatus(idle_hello()))
        .await
        .unwrap();
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn rejected_resume_identifies_again() {
    let gateway = FakeGateway::new();
    gateway.reject_resume(true);
    let client = builder(&gateway, "token-resume-rejected")
        .reconnect_config(quick_retries())
        .build()
        .unwrap();

    timeout(WAIT, client.connect()).await.unwrap().unwrap();
    gateway.drop_connections(None);

    // INVALID_SESSION makes the shard wait up to five seconds before retrying
    let within = Duration::from_secs(10);
    assert!(eventually(within, || gateway.identifies().len() == 2 && all_connected(&client)).await);
    assert_eq!(gateway.commands(6).len(), 1);
    assert_eq!(gateway.identifies()[1].shard, [0, 1]);
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn zombie_connection_is_replaced() {
    let gateway = FakeGateway::new();
    gateway.heartbeat_interval(50);
    let client = builder(&gateway, "token-zombie")
        .reconnect_config(quick_retries())
        .build()
        .unwrap();

    timeout(WAIT, client.connect()).await.unwrap().unwrap();
    gateway.withhold_acks(true);
    assert!(eventually(WAIT, || gateway.connections() >= 2).await);

    gateway.withhold_acks(false);
    assert!(eventually(WAIT, || !gateway.commands(6).is_empty() && all_connected(&client)).await);
    assert_eq!(gateway.identifies().len(), 1);
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn authentication_failure_ends_connect() {
    let gateway = FakeGateway::new();
    gateway.close_identify(Some(4004));
    let client = builder(&gateway, "token-bad")
        .reconnect_config(quick_retries())
        .build()
        .unwrap();

    let err = assert_err!(timeout(WAIT, client.connect()).await.unwrap());
    assert!(
        matches!(err, ClientError::HandshakeFailed { shard_id: 0, .. }),
        "{err:?}"
    );
    assert_eq!(gateway.connections(), 1);
    assert!(!client.is_ready());
}

#[tokio::test]
async fn unreachable_gateway_exhausts_retries() {
    let gateway = FakeGateway::new();
    gateway.refuse_connections(true);
    let client = builder(&gateway, "token-unreachable")
        .reconnect_config(ReconnectConfig {
            max_attempts: 3,
            ..quick_retries()
        })
        .build()
        .unwrap();

    let err = assert_err!(timeout(WAIT, client.connect()).await.unwrap());
    assert!(
        matches!(
            err,
            ClientError::ReconnectLimitExceeded {
                shard_id: 0,
                attempts: 3
            }
        ),
        "{err:?}"
    );
    assert_eq!(gateway.connections(), 3);
}

#[tokio::test]
async fn replayed_dispatches_reach_handlers_once() {
    let gateway = FakeGateway::new();
    gateway.duplicate_dispatches(true);
    let client = builder(&gateway, "token-replay").build().unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    client.on(EventKind::PresenceUpdate, move |_ctx, _event| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    timeout(WAIT, client.connect()).await.unwrap().unwrap();
    client
        .emit(GatewayCommand::UpdateStatus(idle_hello()))
        .await
        .unwrap();

    assert!(eventually(WAIT, || seen.load(Ordering::SeqCst) == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    client.disconnect().await.unwrap();
}
