//! Clustered in-memory users API.
//!
//! One primary process forks and supervises a fixed topology of workers
//! and routes typed JSON envelopes between them over a loopback control
//! socket. Each module owns a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for the primary.
//! - [`primary`] forks the topology, owns the worker registry, routes
//!   every control-channel envelope, and respawns dead workers.
//! - [`db`] is the single worker owning the [`store::Store`].
//! - [`balancer`] round-robins inbound HTTP across the request workers.
//! - [`gateway`] is the stateless HTTP front end that suspends responses
//!   on a correlation-id map while the DB round-trip completes.
//! - [`message`] defines the wire protocol and the JSON line framing.
//! - [`control`] is the worker-side control-channel plumbing.
//! - [`validate`] rejects bad ids and bodies before any IPC happens.
//! - [`worker`] re-enters a forked process into its assigned role.
//!
//! Integration tests exercise the gateway against a stub primary, and the
//! end-to-end tests fork a real cluster through the binary.

pub mod balancer;
pub mod cli;
pub mod control;
pub mod db;
pub mod gateway;
pub mod message;
pub mod primary;
pub mod store;
pub mod validate;
pub mod worker;
