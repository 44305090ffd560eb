//! Synchronous client: discovers a service, connects with failover and runs
//! one request/reply exchange at a time.

use std::{
    io::{self, BufReader},
    marker::PhantomData,
    net::{Shutdown as SocketShutdown, TcpStream},
    thread,
    time::Duration,
};

use tracing::{debug, error, info, warn};

use crate::{
    codec::{self, Payload},
    discovery::{self, DEFAULT_LISTEN_WINDOW, DiscoveryConfig, Endpoint},
    wire::{self, Command, ProtocolError},
};

pub const DEFAULT_RETRY_ROUNDS: usize = 5;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub discovery: DiscoveryConfig,
    /// How long to listen for announcements at construction.
    pub discovery_timeout: Duration,
    /// Full passes over the endpoint set before giving up for good.
    pub retry_rounds: usize,
    /// Pause between two failed passes.
    pub retry_backoff: Duration,
    pub connect_timeout: Duration,
    /// Bound on waiting for a reply. `None` waits forever.
    pub reply_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            discovery: DiscoveryConfig::default(),
            discovery_timeout: DEFAULT_LISTEN_WINDOW,
            retry_rounds: DEFAULT_RETRY_ROUNDS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reply_timeout: Some(DEFAULT_REPLY_TIMEOUT),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Endpoint set known, no open connection.
    Discovered,
    Connected,
    /// Every retry round failed. Terminal.
    Failed,
}

struct Connection {
    endpoint: Endpoint,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Connection {
    fn open(endpoint: &Endpoint, config: &ClientConfig) -> io::Result<Self> {
        let addr = endpoint.socket_addr()?;
        let stream = TcpStream::connect_timeout(&addr, config.connect_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(config.reply_timeout)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            endpoint: endpoint.clone(),
            reader,
            writer: stream,
        })
    }

    fn close(self) {
        if let Err(error) = self.writer.shutdown(SocketShutdown::Both) {
            debug!(endpoint = %self.endpoint, ?error, "connection already closed");
        }
    }
}

/// Client bound to one tag, exchanging values of type `T`.
pub struct Client<T> {
    tag: String,
    config: ClientConfig,
    endpoints: Vec<Endpoint>,
    cursor: usize,
    failed: bool,
    connection: Option<Connection>,
    _payload: PhantomData<fn(T) -> T>,
}

impl<T: Payload> Client<T> {
    /// Listens for announcements of `tag` for `config.discovery_timeout` and
    /// keeps the endpoints of the last one heard, possibly none.
    pub fn discover(tag: impl Into<String>, config: ClientConfig) -> Self {
        let tag = tag.into();
        let endpoints = discovery::discover(&tag, config.discovery_timeout, &config.discovery);
        if endpoints.is_empty() {
            warn!(%tag, "no service discovered");
        }
        Self::build(tag, endpoints, config)
    }

    /// Skips discovery and uses a known endpoint set.
    pub fn with_endpoints(
        tag: impl Into<String>,
        endpoints: Vec<Endpoint>,
        config: ClientConfig,
    ) -> Self {
        Self::build(tag.into(), endpoints, config)
    }

    fn build(tag: String, endpoints: Vec<Endpoint>, config: ClientConfig) -> Self {
        Self {
            tag,
            config,
            endpoints,
            cursor: 0,
            failed: false,
            connection: None,
            _payload: PhantomData,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn state(&self) -> ClientState {
        if self.failed {
            ClientState::Failed
        } else if self.connection.is_some() {
            ClientState::Connected
        } else {
            ClientState::Discovered
        }
    }

    pub fn connected_to(&self) -> Option<&Endpoint> {
        self.connection.as_ref().map(|connection| &connection.endpoint)
    }

    /// Connects to the next reachable endpoint after the one used last.
    ///
    /// Each round tries every endpoint once, starting at the rotation
    /// cursor. After `retry_rounds` failed rounds the client is FAILED and
    /// every later call is a no-op.
    pub fn connect_next(&mut self) -> &mut Self {
        if self.failed {
            return self;
        }
        self.disconnect();

        for round in 0..self.config.retry_rounds {
            for index in rotation(self.cursor, self.endpoints.len()) {
                let endpoint = &self.endpoints[index];
                match Connection::open(endpoint, &self.config) {
                    Ok(connection) => {
                        info!(tag = %self.tag, %endpoint, index, "connected");
                        self.cursor = (index + 1) % self.endpoints.len();
                        self.connection = Some(connection);
                        return self;
                    }
                    Err(error) => warn!(%endpoint, round, ?error, "connect failed"),
                }
            }
            thread::sleep(self.config.retry_backoff);
        }

        error!(tag = %self.tag, rounds = self.config.retry_rounds, "there is no server");
        self.failed = true;
        self
    }

    pub fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            debug!(endpoint = %connection.endpoint, "client disconnected");
            connection.close();
        }
    }

    pub fn load(&mut self, value: &T) -> Option<T> {
        self.send(Command::Load, value, false)
    }

    pub fn load_and_close(&mut self, value: &T) -> Option<T> {
        self.send(Command::Load, value, true)
    }

    pub fn save(&mut self, value: &T) -> Option<T> {
        self.send(Command::Save, value, false)
    }

    pub fn save_and_close(&mut self, value: &T) -> Option<T> {
        self.send(Command::Save, value, true)
    }

    pub fn delete(&mut self, value: &T) -> Option<T> {
        self.send(Command::Delete, value, false)
    }

    pub fn delete_and_close(&mut self, value: &T) -> Option<T> {
        self.send(Command::Delete, value, true)
    }

    /// Sends one request and waits for its reply.
    ///
    /// Returns `None` when the client is FAILED or not connected, and on any
    /// transport or decode failure. Transport failures, a reply timeout
    /// included, drop the connection.
    pub fn send(&mut self, command: Command, value: &T, close_after: bool) -> Option<T> {
        if self.failed {
            return None;
        }
        let result = match self.connection.as_mut() {
            Some(connection) => exchange(connection, command, value),
            None => {
                debug!(%command, "not connected");
                return None;
            }
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(ProtocolError::Io(error)) if is_timeout(&error) => {
                warn!(%command, "no reply within timeout, dropping connection");
                self.disconnect();
                None
            }
            Err(error) => {
                warn!(%command, %error, "request failed, dropping connection");
                self.disconnect();
                None
            }
        };

        if close_after {
            self.disconnect();
        }
        reply
    }
}

impl<T> Drop for Client<T> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }
}

fn exchange<T: Payload>(
    connection: &mut Connection,
    command: Command,
    value: &T,
) -> Result<Option<T>, ProtocolError> {
    let payload = match codec::encode(value) {
        Ok(payload) => payload,
        Err(error) => {
            error!(%command, %error, "failed to encode request");
            return Ok(None);
        }
    };
    wire::write_request(&mut connection.writer, command, T::TYPE_ID, &payload)?;

    let Some(frame) = wire::read_response(&mut connection.reader)? else {
        let closed = io::Error::new(io::ErrorKind::UnexpectedEof, "service closed the connection");
        return Err(closed.into());
    };

    if frame.type_id != T::TYPE_ID {
        warn!(expected = T::TYPE_ID, received = %frame.type_id, "unexpected reply type");
        return Ok(None);
    }
    match codec::decode::<T>(&frame.payload) {
        Ok(reply) => Ok(Some(reply)),
        Err(error) => {
            warn!(%error, "failed to decode reply");
            Ok(None)
        }
    }
}

fn is_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Order in which one round visits a set of `len` endpoints from `cursor`.
fn rotation(cursor: usize, len: usize) -> impl Iterator<Item = usize> {
    let start = if len == 0 { 0 } else { cursor % len };
    (0..len).map(move |offset| (start + offset) % len)
}
