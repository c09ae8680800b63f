//! Clients talking through the in-process fabric

use assert_matches::assert_matches;
use async_trait::async_trait;
use fabric_core::{
    decode_envelope, request_token, AccountId, DestinationId, FabricError, FabricResult,
    GroupPath, Route, TimeBasedIdGenerator,
};
use fabric_transport::{
    BackoffConfig, CallShape, ConnectionState, FabricBuilder, FabricClient, GateStatus,
    MemoryFabric, MethodDescriptor, OutboundStream, Payload, PayloadStream, ReconnectingSession,
    RequestHandler, ServiceDescriptor, ServiceHandler, SessionIdentity,
};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const ACCOUNT: u64 = 100;

fn client(fabric: &MemoryFabric, destination: &str, group: &str) -> FabricClient {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    FabricBuilder::new()
        .account_id(ACCOUNT)
        .access_key(7)
        .destination(destination)
        .group(group)
        .backoff(BackoffConfig::testing())
        .presence_timeout(Duration::from_secs(2))
        .build(Arc::new(fabric.clone()))
        .unwrap()
}

fn group(name: &str) -> GroupPath {
    GroupPath::from_name(name).unwrap()
}

async fn established(client: &FabricClient) {
    tokio::time::timeout(
        Duration::from_secs(5),
        client
            .session()
            .wait_for_state(|state| *state == ConnectionState::Established),
    )
    .await
    .unwrap()
    .unwrap();
}

fn greeter() -> ServiceDescriptor {
    ServiceDescriptor::builder("greeter")
        .method("hello", CallShape::RequestResponse)
        .method("count", CallShape::RequestStream)
        .method("poke", CallShape::FireAndForget)
        .method("shout", CallShape::RequestChannel)
        .build()
        .unwrap()
}

#[derive(Default)]
struct Greeter {
    pokes: AtomicUsize,
}

#[async_trait]
impl ServiceHandler for Greeter {
    async fn fire_and_forget(
        &self,
        _method: &MethodDescriptor,
        _payload: Payload,
    ) -> FabricResult<()> {
        self.pokes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn request_response(
        &self,
        _method: &MethodDescriptor,
        payload: Payload,
    ) -> FabricResult<Payload> {
        Ok(Payload::from_data([b"hello ".as_slice(), &payload.data].concat()))
    }

    async fn request_stream(
        &self,
        _method: &MethodDescriptor,
        payload: Payload,
    ) -> FabricResult<PayloadStream> {
        let count = payload.data.first().copied().unwrap_or(0);
        Ok(stream::iter((0..count).map(|i| Ok(Payload::from_data(vec![i])))).boxed())
    }

    async fn request_channel(
        &self,
        _method: &MethodDescriptor,
        first: Payload,
        rest: OutboundStream,
    ) -> FabricResult<PayloadStream> {
        let upper = |payload: Payload| -> FabricResult<Payload> {
            Ok(Payload::from_data(payload.data.to_ascii_uppercase()))
        };
        Ok(stream::once(async move { first })
            .chain(rest)
            .map(upper)
            .boxed())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_group_request_without_peer_times_out() {
    let fabric = MemoryFabric::new();
    let alone = client(&fabric, "tester", "test.client");
    established(&alone).await;

    // The sender is excluded from its own group, so nothing can answer.
    let socket = alone
        .socket_to_group(AccountId(ACCOUNT), &group("test.client"))
        .unwrap();
    let started = Instant::now();
    let result = socket
        .request_response_within(
            Payload::from_data(b"anyone?".to_vec()),
            Duration::from_secs(2),
        )
        .await;

    assert_matches!(result, Err(ref err) if err.is_timeout());
    assert!(started.elapsed() >= Duration::from_secs(2));
    alone.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_presence_times_out_then_is_acknowledged() {
    let fabric = MemoryFabric::new();
    let caller = client(&fabric, "caller", "test.client");
    let notifier = caller.presence_notifier();

    let target = Route::ByGroup {
        account_id: AccountId(ACCOUNT),
        group: group("test.server"),
    };
    let missing = notifier
        .announce(target.clone(), Duration::from_millis(200))
        .await;
    assert_matches!(missing, Err(FabricError::Timeout { .. }));
    assert!(notifier.pending().is_empty());

    let server = client(&fabric, "server", "test.server");
    established(&server).await;

    let ack = notifier
        .notify(AccountId(ACCOUNT), &group("test.server"))
        .await
        .unwrap();
    assert_eq!(ack.target, target);
    assert_eq!(ack.responder, Some(server.destination_id()));
    assert!(notifier.pending().is_empty());

    let direct = notifier
        .notify_destination(
            AccountId(ACCOUNT),
            server.destination_id(),
            &group("test.server"),
        )
        .await
        .unwrap();
    assert_eq!(direct.responder, Some(server.destination_id()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_queues_until_peer_registers() {
    let fabric = MemoryFabric::new();
    let caller = client(&fabric, "caller", "test.client");
    let descriptor = Arc::new(greeter());
    let proxy = caller
        .proxy(
            descriptor.clone(),
            Route::ByGroup {
                account_id: AccountId(ACCOUNT),
                group: group("test.server"),
            },
        )
        .unwrap();

    let pending = tokio::spawn(async move {
        let mut replies = proxy
            .call("hello", Payload::from_data(b"world".to_vec()))
            .await?;
        replies.next().await.unwrap_or_else(|| Err(FabricError::closed("no reply")))
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!pending.is_finished());

    let server = client(&fabric, "server", "test.server");
    server
        .register_handler(&descriptor, Arc::new(Greeter::default()))
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply.data, b"hello world");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_proxy_covers_every_shape() {
    let fabric = MemoryFabric::new();
    let descriptor = Arc::new(greeter());
    let server = client(&fabric, "server", "test.server");
    let greeter = Arc::new(Greeter::default());
    server.register_handler(&descriptor, greeter.clone()).unwrap();
    established(&server).await;

    let caller = client(&fabric, "caller", "test.client");
    let proxy = caller
        .proxy(
            descriptor,
            Route::ByDestination {
                account_id: AccountId(ACCOUNT),
                destination_id: server.destination_id(),
                group: group("test.server"),
            },
        )
        .unwrap();

    let replies: Vec<_> = proxy
        .call("hello", Payload::from_data(b"proxy".to_vec()))
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].as_ref().unwrap().data, b"hello proxy");

    let counted: Vec<u8> = proxy
        .call("count", Payload::from_data(vec![3]))
        .await
        .unwrap()
        .map(|reply| reply.unwrap().data[0])
        .collect()
        .await;
    assert_eq!(counted, vec![0, 1, 2]);

    let poked: Vec<_> = proxy
        .call("poke", Payload::default())
        .await
        .unwrap()
        .collect()
        .await;
    assert!(poked.is_empty());
    tokio::time::timeout(Duration::from_secs(5), async {
        while greeter.pokes.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let shouted: Vec<Vec<u8>> = proxy
        .channel(
            "shout",
            stream::iter([
                Payload::from_data(b"one".to_vec()),
                Payload::from_data(b"two".to_vec()),
            ])
            .boxed(),
        )
        .await
        .unwrap()
        .map(|reply| reply.unwrap().data)
        .collect()
        .await;
    assert_eq!(shouted, vec![b"ONE".to_vec(), b"TWO".to_vec()]);

    assert_matches!(
        proxy.call("missing", Payload::default()).await.map(|_| ()),
        Err(FabricError::InvalidArgument { .. })
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_severed_link_reconnects_and_republishes() {
    let fabric = MemoryFabric::new();
    let slow = BackoffConfig {
        floor_ms: 200,
        step_ms: 200,
        ceiling_ms: 1000,
    };
    let caller = FabricBuilder::new()
        .account_id(ACCOUNT)
        .destination("caller")
        .group("test.client")
        .backoff(slow)
        .build(Arc::new(fabric.clone()))
        .unwrap();
    established(&caller).await;
    let session = caller.session().clone();
    assert_eq!(session.handshakes(), 1);
    let first = session.current().await.unwrap().generation();

    assert_eq!(fabric.sever(caller.destination_id()), 1);
    let state = tokio::time::timeout(
        Duration::from_secs(5),
        session.wait_for_state(|state| matches!(state, ConnectionState::Reconnecting { .. })),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(
        state,
        ConnectionState::Reconnecting {
            delay: Duration::from_millis(200)
        }
    );
    assert_eq!(session.gate_status(), GateStatus::Invalid);
    assert_eq!(session.availability(), 0.0);

    // A request issued during the outage waits for the next session.
    let server = client(&fabric, "server", "test.server");
    server
        .register_handler(&greeter(), Arc::new(Greeter::default()))
        .unwrap();
    let proxy = caller
        .proxy(
            Arc::new(greeter()),
            Route::ByGroup {
                account_id: AccountId(ACCOUNT),
                group: group("test.server"),
            },
        )
        .unwrap();
    let mut replies = proxy
        .call("hello", Payload::from_data(b"again".to_vec()))
        .await
        .unwrap();
    assert_eq!(replies.next().await.unwrap().unwrap().data, b"hello again");

    established(&caller).await;
    assert_eq!(session.handshakes(), 2);
    assert_eq!(session.gate_status(), GateStatus::Valid);
    assert_eq!(session.current_backoff(), Duration::ZERO);
    assert!(session.current().await.unwrap().generation() > first);
    assert!(fabric.is_registered(caller.destination_id()));
}

#[tokio::test]
async fn test_request_right_after_sever_waits_for_new_session() {
    let fabric = MemoryFabric::new();
    let descriptor = Arc::new(greeter());
    let server = client(&fabric, "server", "test.server");
    server
        .register_handler(&descriptor, Arc::new(Greeter::default()))
        .unwrap();
    let caller = client(&fabric, "caller", "test.client");
    established(&server).await;
    established(&caller).await;

    let proxy = caller
        .proxy(
            descriptor,
            Route::ByGroup {
                account_id: AccountId(ACCOUNT),
                group: group("test.server"),
            },
        )
        .unwrap();

    // No yield between the sever and the call: the gate still holds the dead session.
    fabric.sever(caller.destination_id());
    assert_eq!(caller.session().gate_status(), GateStatus::Valid);
    let mut replies = proxy
        .call("hello", Payload::from_data(b"again".to_vec()))
        .await
        .unwrap();
    assert_eq!(replies.next().await.unwrap().unwrap().data, b"hello again");
    assert_eq!(caller.session().handshakes(), 2);

    fabric.sever(caller.destination_id());
    let socket = caller
        .socket_to_group(AccountId(ACCOUNT), &group("test.server"))
        .unwrap();
    let pushed = socket
        .metadata_push(Payload::new(Vec::new(), b"note".to_vec()))
        .await;
    assert!(pushed.is_ok());
    assert_eq!(caller.session().handshakes(), 3);
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(Vec<u8>, u32, u64)>>,
}

#[async_trait]
impl RequestHandler for Recorder {
    async fn request_response(&self, payload: Payload) -> FabricResult<Payload> {
        let envelope = decode_envelope(&payload.metadata)?;
        self.seen.lock().push((
            payload.data.clone(),
            envelope.header.request_token,
            envelope.header.request_id,
        ));
        Ok(Payload::from_data(payload.data))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_use_distinct_counters() {
    const REQUESTS: u64 = 64;
    let fabric = MemoryFabric::new();

    let recorder = Arc::new(Recorder::default());
    let server_id = DestinationId::from_name("recorder");
    let server = ReconnectingSession::start(
        SessionIdentity {
            account_id: AccountId(ACCOUNT),
            destination_id: server_id,
            group: group("test.server"),
            access_token: vec![0; 20],
        },
        Arc::new(fabric.clone()),
        recorder.clone(),
        BackoffConfig::testing(),
        Arc::new(TimeBasedIdGenerator::new(server_id.value())),
    )
    .unwrap();

    let caller = client(&fabric, "caller", "test.client");
    established(&caller).await;
    let socket = caller
        .socket_to_destination(AccountId(ACCOUNT), server_id, &group("test.server"))
        .unwrap();

    let requests: Vec<_> = (0..REQUESTS)
        .map(|i| {
            let socket = socket.clone();
            tokio::spawn(async move {
                socket
                    .request_response(Payload::from_data(i.to_be_bytes().to_vec()))
                    .await
            })
        })
        .collect();
    for request in requests {
        request.await.unwrap().unwrap();
    }

    let key = caller.session().current_session_key().await.unwrap();
    let seen = recorder.seen.lock().clone();
    assert_eq!(seen.len() as u64, REQUESTS);

    let mut counters = HashSet::new();
    let mut request_ids = HashSet::new();
    for (data, token, request_id) in &seen {
        let counter = (1..=REQUESTS)
            .find(|c| request_token(&key, data, *c).unwrap() == *token)
            .expect("token matches no counter");
        assert!(counters.insert(counter), "counter {counter} used twice");
        assert!(request_ids.insert(*request_id));
    }
    assert_eq!(counters, (1..=REQUESTS).collect::<HashSet<_>>());
    assert_eq!(
        caller.session().current_counter().await.unwrap().load(Ordering::SeqCst),
        REQUESTS
    );
    server.close();
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_balanced_client_follows_weights() {
    const REFUSING: &str = "10.0.0.1:8001";
    const HEALTHY: &str = "10.0.0.2:8001";
    let fabric = MemoryFabric::new();
    fabric.refuse_address(REFUSING);

    let caller = FabricBuilder::new()
        .account_id(ACCOUNT)
        .destination("caller")
        .group("test.client")
        .backoff(BackoffConfig::testing())
        .link(REFUSING, 1.0)
        .link(HEALTHY, 4.0)
        .build_balanced(Arc::new(fabric.clone()))
        .unwrap();
    established(&caller).await;

    let pool = caller.pool().unwrap().clone();
    assert_eq!(fabric.dialed(), vec![HEALTHY.to_string()]);
    assert_eq!(pool.active_connections(HEALTHY), Some(1));
    assert_eq!(pool.active_connections(REFUSING), Some(0));

    // Prefer the refusing link; the severed session keeps failing against it.
    pool.set_weight(REFUSING, 10.0).unwrap();
    fabric.sever(caller.destination_id());
    eventually(|| fabric.dialed().iter().any(|address| address == REFUSING)).await;
    eventually(|| pool.active_connections(HEALTHY) == Some(0)).await;

    pool.set_weight(REFUSING, 0.5).unwrap();
    eventually(|| fabric.is_registered(caller.destination_id())).await;
    established(&caller).await;
    assert_eq!(
        fabric
            .dialed()
            .iter()
            .filter(|address| *address == HEALTHY)
            .count(),
        2
    );

    caller.close();
    eventually(|| pool.active_connections(HEALTHY) == Some(0)).await;
    assert_eq!(pool.active_connections(REFUSING), Some(0));
    assert_eq!(fabric.live_links(), 0);
}
