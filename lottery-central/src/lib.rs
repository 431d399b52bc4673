//! Lottery central: collects bets from a fixed set of agencies and reports
//! each agency's winners once all of them have finished submitting.
//!
//! Each module focuses on a concrete responsibility:
//!
//! - [`bet`] defines bet records, batches and their text encodings.
//! - [`protocol`] frames requests with a two-byte length prefix and encodes
//!   the single-line responses.
//! - [`store`] appends accepted bets to memory or a CSV file.
//! - [`settlement`] holds the completion barrier and the draw rule.
//! - [`central`] guards the store and the barrier behind one lock.
//! - [`server`] accepts TCP connections, enforces the connection limit and
//!   runs one handler task per agency connection.
//! - [`agency`] is the client side: it streams a bets file in batches and
//!   polls for the winners.
//! - [`cli`] parses the command-line interface for both modes.

pub mod agency;
pub mod bet;
pub mod central;
pub mod cli;
pub mod protocol;
pub mod server;
pub mod settlement;
pub mod store;
