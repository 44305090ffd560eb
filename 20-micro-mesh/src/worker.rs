use std::{
    io::BufReader,
    net::TcpStream,
    panic::{self, AssertUnwindSafe},
};

use tracing::{debug, error, warn};

use crate::{
    codec::{AnyValue, Registry},
    shutdown::Shutdown,
    wire::{self, Command, ProtocolError, RequestFrame},
};

/// Application callback: maps a command and its decoded value to an optional reply.
pub type Handler = dyn Fn(Command, AnyValue) -> Option<AnyValue> + Send + Sync;

/// Everything a worker needs to answer requests: the type registry and the handler.
pub struct Dispatch {
    registry: Registry,
    handler: Box<Handler>,
}

impl Dispatch {
    pub fn new<F>(registry: Registry, handler: F) -> Self
    where
        F: Fn(Command, AnyValue) -> Option<AnyValue> + Send + Sync + 'static,
    {
        Self {
            registry,
            handler: Box::new(handler),
        }
    }

    /// Serves requests on `stream` until the peer closes it, an I/O error
    /// occurs or shutdown is requested.
    ///
    /// Undecodable payloads are dropped without a reply and the connection
    /// stays open. A malformed header ends the connection with an error.
    pub fn serve_connection(
        &self,
        stream: &TcpStream,
        shutdown: &Shutdown,
    ) -> Result<(), ProtocolError> {
        let mut reader = BufReader::new(stream);
        let mut writer = stream;

        while !shutdown.is_triggered() {
            let Some(frame) = wire::read_request(&mut reader)? else {
                break;
            };
            if let Some((type_id, payload)) = self.handle(frame) {
                wire::write_response(&mut writer, type_id, &payload)?;
            }
        }

        Ok(())
    }

    /// Decodes one request, runs the handler and encodes its reply, if any.
    pub fn handle(&self, frame: RequestFrame) -> Option<(&'static str, String)> {
        let RequestFrame {
            command,
            type_id,
            payload,
        } = frame;

        let value = match self.registry.decode(&type_id, &payload) {
            Ok(value) => value,
            Err(error) => {
                warn!(%command, %type_id, %error, "dropping undecodable request");
                return None;
            }
        };

        let reply = match panic::catch_unwind(AssertUnwindSafe(|| (self.handler)(command, value))) {
            Ok(reply) => reply?,
            Err(_) => {
                error!(%command, %type_id, "request handler panicked");
                return None;
            }
        };

        match self.registry.encode(reply.as_ref()) {
            Ok(encoded) => Some(encoded),
            Err(error) => {
                error!(%command, %error, "failed to encode reply");
                None
            }
        }
    }
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatch").finish_non_exhaustive()
    }
}

pub(crate) fn log_connection_end(worker: usize, result: Result<(), ProtocolError>) {
    match result {
        Ok(()) => debug!(worker, "connection finished"),
        Err(ProtocolError::Io(error)) => debug!(worker, ?error, "connection dropped"),
        Err(error) => warn!(worker, %error, "closing connection after protocol violation"),
    }
}
