use std::{
    io::{BufReader, Read, Write},
    net::{Ipv4Addr, TcpListener, TcpStream, UdpSocket},
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use micro_mesh::{
    client::{Client, ClientConfig, ClientState},
    codec::{AnyValue, Payload, Registry},
    discovery::{DiscoveryConfig, Endpoint},
    service::{Service, ServiceConfig},
    wire::{self, Command},
};
use serde::{Deserialize, Serialize};

const WAIT_LIMIT: Duration = Duration::from_secs(5);
const SLOW_REPLY: Duration = Duration::from_millis(400);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ping {
    name: String,
}

impl Ping {
    fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Payload for Ping {
    const TYPE_ID: &'static str = "ping";
}

/// Answers LOAD with a greeting for the ping's name and declines the rest.
/// Names starting with `slow` are answered after [`SLOW_REPLY`].
fn joe(command: Command, value: AnyValue) -> Option<AnyValue> {
    let ping = value.downcast::<Ping>().ok()?;
    match command {
        Command::Load => {
            if ping.name.starts_with("slow") {
                thread::sleep(SLOW_REPLY);
            }
            let reply: AnyValue = Box::new(Ping::named(format!("Joe greets {}", ping.name)));
            Some(reply)
        }
        Command::Save | Command::Delete => None,
    }
}

/// A loopback-only service whose announcements go to a local sink socket.
struct Harness {
    service: Service,
    _sink: UdpSocket,
}

impl Harness {
    fn start(max_concurrent_clients: usize) -> Result<Self> {
        let sink = UdpSocket::bind("127.0.0.1:0")?;
        let mut config = ServiceConfig::new("joe", max_concurrent_clients)
            .with_interfaces(vec![Ipv4Addr::LOCALHOST]);
        config.discovery = DiscoveryConfig {
            group: Ipv4Addr::LOCALHOST,
            port: sink.local_addr()?.port(),
            announce_interval: Duration::from_millis(50),
            ..DiscoveryConfig::default()
        };
        config.stop_grace = Duration::from_millis(500);

        let mut service = Service::new(config, Registry::new().with::<Ping>(), joe);
        service.start()?;
        Ok(Self {
            service,
            _sink: sink,
        })
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        self.service
            .running()
            .map(|running| running.endpoints().to_vec())
            .unwrap_or_default()
    }

    fn active_workers(&self) -> usize {
        self.service
            .running()
            .map(|running| running.active_workers())
            .unwrap_or_default()
    }

    fn client(&self) -> Client<Ping> {
        Client::with_endpoints("joe", self.endpoints(), quick_config())
    }

    fn raw_stream(&self) -> Result<TcpStream> {
        let endpoint = self.endpoints().into_iter().next().context("no endpoint")?;
        let stream = TcpStream::connect(endpoint.socket_addr()?)?;
        stream.set_read_timeout(Some(WAIT_LIMIT))?;
        Ok(stream)
    }

    fn wait_for_idle(&self) {
        wait_until(|| self.active_workers() == 0);
    }
}

fn quick_config() -> ClientConfig {
    ClientConfig {
        retry_backoff: Duration::from_millis(20),
        connect_timeout: Duration::from_millis(500),
        reply_timeout: Some(Duration::from_secs(3)),
        ..ClientConfig::default()
    }
}

fn wait_until(condition: impl Fn() -> bool) {
    let started = Instant::now();
    while !condition() {
        assert!(started.elapsed() < WAIT_LIMIT, "condition never held");
        thread::sleep(Duration::from_millis(10));
    }
}

/// An address nothing listens on.
fn dead_endpoint() -> Result<Endpoint> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(Endpoint::from(addr))
}

#[test]
fn hundred_loads_share_one_connection() -> Result<()> {
    let harness = Harness::start(2)?;
    let mut client = harness.client();
    client.connect_next();
    assert_eq!(client.state(), ClientState::Connected);

    for i in 0..100 {
        let reply = client.load(&Ping::named(format!("caller-{i}")));
        assert_eq!(reply, Some(Ping::named(format!("Joe greets caller-{i}"))));
    }
    assert_eq!(client.state(), ClientState::Connected);
    Ok(())
}

#[test]
fn single_worker_is_reused_across_connections() -> Result<()> {
    let harness = Harness::start(1)?;
    let mut client = harness.client();

    for i in 0..100 {
        let reply = client
            .connect_next()
            .load_and_close(&Ping::named(i.to_string()));
        assert_eq!(reply, Some(Ping::named(format!("Joe greets {i}"))), "round {i}");
        assert_eq!(client.state(), ClientState::Discovered);
    }
    harness.wait_for_idle();
    Ok(())
}

#[test]
fn concurrent_clients_get_their_own_replies() -> Result<()> {
    let harness = Harness::start(50)?;
    let endpoints = harness.endpoints();

    thread::scope(|scope| {
        for caller in 0..50 {
            let endpoints = endpoints.clone();
            scope.spawn(move || {
                let mut client: Client<Ping> =
                    Client::with_endpoints("joe", endpoints, quick_config());
                client.connect_next();
                for round in 0..20 {
                    let name = format!("{caller}/{round}");
                    let reply = client.load(&Ping::named(name.clone()));
                    assert_eq!(reply, Some(Ping::named(format!("Joe greets {name}"))));
                }
            });
        }
    });

    harness.wait_for_idle();
    Ok(())
}

#[test]
fn connections_beyond_capacity_are_shed() -> Result<()> {
    let harness = Harness::start(2)?;
    let mut first = harness.client();
    let mut second = harness.client();
    assert!(first.connect_next().load(&Ping::named("a")).is_some());
    assert!(second.connect_next().load(&Ping::named("b")).is_some());
    assert_eq!(harness.active_workers(), 2);

    let mut third = harness.raw_stream()?;
    let started = Instant::now();
    let mut buf = [0u8; 16];
    match third.read(&mut buf) {
        Ok(read) => assert_eq!(read, 0, "shed connection must not receive data"),
        Err(error) => assert!(
            !matches!(
                error.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            "shed connection was never closed"
        ),
    }
    assert!(started.elapsed() < Duration::from_secs(4));

    assert!(first.load(&Ping::named("a")).is_some());
    assert!(second.load(&Ping::named("b")).is_some());
    Ok(())
}

fn impatient_client(harness: &Harness) -> Client<Ping> {
    Client::with_endpoints(
        "joe",
        harness.endpoints(),
        ClientConfig {
            reply_timeout: Some(Duration::from_millis(200)),
            ..quick_config()
        },
    )
}

#[test]
fn declined_request_drops_the_connection() -> Result<()> {
    let harness = Harness::start(1)?;
    let mut client = impatient_client(&harness);
    client.connect_next();

    assert_eq!(client.save(&Ping::named("declined")), None);
    assert_eq!(client.state(), ClientState::Discovered);

    client.connect_next();
    assert_eq!(
        client.load(&Ping::named("again")),
        Some(Ping::named("Joe greets again"))
    );
    Ok(())
}

#[test]
fn late_reply_is_not_taken_for_the_next_one() -> Result<()> {
    let harness = Harness::start(2)?;
    let mut client = impatient_client(&harness);
    client.connect_next();

    assert_eq!(client.load(&Ping::named("slow")), None);
    assert_eq!(client.state(), ClientState::Discovered);
    thread::sleep(SLOW_REPLY);

    client.connect_next();
    assert_eq!(
        client.load(&Ping::named("fast")),
        Some(Ping::named("Joe greets fast"))
    );
    assert_eq!(client.state(), ClientState::Connected);
    Ok(())
}

#[test]
fn undecodable_payload_keeps_the_connection() -> Result<()> {
    let harness = Harness::start(1)?;
    let stream = harness.raw_stream()?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    wire::write_request(&mut writer, Command::Load, "ping", "{not json")?;
    wire::write_request(&mut writer, Command::Load, "unknown-type", "{}")?;
    wire::write_request(&mut writer, Command::Load, "ping", r#"{"name":"raw"}"#)?;

    let frame = wire::read_response(&mut reader)?.context("no reply after bad payloads")?;
    assert_eq!(frame.type_id, "ping");
    assert_eq!(frame.payload, r#"{"name":"Joe greets raw"}"#);
    Ok(())
}

#[test]
fn framing_violation_closes_and_frees_the_worker() -> Result<()> {
    let harness = Harness::start(1)?;
    let mut stream = harness.raw_stream()?;
    stream.write_all(b"LOAD ping\n{}\n")?;

    let mut rest = Vec::new();
    let closed = stream.read_to_end(&mut rest);
    assert!(closed.map_or(true, |read| read == 0), "got data: {rest:?}");

    harness.wait_for_idle();
    let mut client = harness.client();
    assert!(client.connect_next().load(&Ping::named("after")).is_some());
    Ok(())
}

#[test]
fn fails_over_to_the_next_endpoint() -> Result<()> {
    let harness = Harness::start(1)?;
    let live = harness.endpoints();
    let mut endpoints = vec![dead_endpoint()?];
    endpoints.extend(live.iter().cloned());

    let mut client: Client<Ping> = Client::with_endpoints("joe", endpoints, quick_config());
    client.connect_next();
    assert_eq!(client.state(), ClientState::Connected);
    assert_eq!(client.connected_to(), live.first());
    assert!(client.load(&Ping::named("f")).is_some());
    Ok(())
}

#[test]
fn exhausted_retries_are_terminal() -> Result<()> {
    let mut client: Client<Ping> =
        Client::with_endpoints("joe", vec![dead_endpoint()?], quick_config());
    client.connect_next();
    assert_eq!(client.state(), ClientState::Failed);

    let started = Instant::now();
    client.connect_next();
    assert_eq!(client.load(&Ping::named("x")), None);
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(client.state(), ClientState::Failed);
    Ok(())
}

#[test]
fn restarts_after_stop() -> Result<()> {
    let mut harness = Harness::start(1)?;
    let first = harness.endpoints();
    let again = harness.service.start()?.endpoints().to_vec();
    assert_eq!(first, again, "start on a running service must be a no-op");

    harness.service.stop();
    assert!(!harness.service.is_running());

    harness.service.start()?;
    assert!(harness.service.is_running());
    let mut client = harness.client();
    assert_eq!(
        client.connect_next().load(&Ping::named("back")),
        Some(Ping::named("Joe greets back"))
    );
    Ok(())
}

#[test]
fn busy_count_returns_to_zero() -> Result<()> {
    let harness = Harness::start(3)?;
    let mut clients: Vec<Client<Ping>> = (0..3).map(|_| harness.client()).collect();
    for client in &mut clients {
        assert!(client.connect_next().load(&Ping::named("c")).is_some());
    }
    assert_eq!(harness.active_workers(), 3);

    for client in &mut clients {
        client.disconnect();
    }
    harness.wait_for_idle();
    Ok(())
}
