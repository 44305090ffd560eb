//! Zero-configuration micro-services on a local network.
//!
//! A service announces its TCP endpoints on a multicast group under a tag;
//! clients listen for the tag, connect to one of the endpoints and exchange
//! typed request/reply values. Everything runs on plain OS threads:
//!
//! - [`discovery`] parses and emits announcements and collects endpoint sets.
//! - [`broadcaster`] re-announces a running service while it has idle workers.
//! - [`wire`] frames requests and responses as short line-oriented envelopes.
//! - [`codec`] maps type identifiers to serde decoders and encoders.
//! - [`worker`] and [`pool`] keep a warm, bounded set of connection workers.
//! - [`acceptor`] accepts connections on one interface and hands them off.
//! - [`service`] starts and stops all of the above as one unit.
//! - [`client`] discovers, connects with failover and sends requests.
//! - [`shutdown`] is the stop signal shared by service threads.
//! - [`cli`] and [`store`] back the `micro_mesh` binary.
//!
//! Integration tests under `tests/` drive a real service over loopback.

pub mod acceptor;
pub mod broadcaster;
pub mod cli;
pub mod client;
pub mod codec;
pub mod discovery;
pub mod pool;
pub mod service;
pub mod shutdown;
pub mod store;
pub mod wire;
pub mod worker;
