//! Protocol engine for the MSN Messenger notification / switchboard protocol: a line-oriented,
//!  transaction-numbered text command protocol spoken over a raw TCP stream or, where direct
//!  sockets are blocked, over an HTTP long-poll tunnel. A binary sub-protocol ("SLP") for
//!  peer-to-peer session negotiation is carried inside message payloads.
//!
//! ## Wire format
//!
//! Commands are single CRLF-terminated lines:
//! ```ascii
//! VERB[ ID][ param1 param2 ...]\r\n
//! ```
//! * `VERB` is a three/four-letter command name (`MSG`, `ADL`, ...). A bare all-digits verb
//!   is a server error reply; its first parameter is the transaction id it refers to.
//! * `ID` is a decimal transaction id, present iff the first parameter is purely numeric.
//!   Requests carry sender-assigned ids so that replies and error codes can be correlated;
//!   server push notifications carry none.
//! * A fixed set of verbs declares a trailing payload: one of the parameters (at a
//!   verb-specific index) is a byte count, and exactly that many raw bytes follow the
//!   command line with no additional delimiter.
//!
//! Payloads are MIME-ish: a `Key: Value\r\n` header block, a blank line, then the body.
//! When `Content-Type` is `application/x-msnmsgrp2p` the body region instead holds a binary
//! SLP frame:
//! ```ascii
//! 0:  session id   (u32 LE)
//! 4:  message id   (u32 LE)
//! 8:  data offset  (u64 LE)
//! 16: total size   (u64 LE)
//! 24: chunk length (u32 LE)
//! 28: flags        (u32 LE)
//! 32: ack id       (u32 LE)
//! 36: ack sub id   (u32 LE)
//! 40: ack size     (u64 LE)
//! 48: chunk data ...
//! *:  footer       (u32 BE)
//! ```
//!
//! ## Structure
//!
//! * [`command`] parses one line into verb + parameters and computes the declared payload
//!   length.
//! * [`transaction`] models an outgoing request and the bounded [`transaction::History`]
//!   used to correlate asynchronous replies back to it.
//! * [`message`] is the payload object with an order-preserving header list; [`slp`] holds
//!   the binary frame codec.
//! * [`cmdproc`] dispatches framed units to registered handlers and reassembles chunked
//!   messages.
//! * [`servconn`] turns raw transport bytes into command lines and declared-length payload
//!   blobs, resumable across arbitrary read splits.
//! * [`httpconn`] tunnels the same byte stream through HTTP POST exchanges against a
//!   gateway, one exchange in flight at a time.
//!
//! The engine is strictly event-driven: each connection owns its framer and dispatcher
//! exclusively, commands are processed in the order they were framed, and outgoing writes
//! are FIFO.

pub mod cmdproc;
pub mod command;
pub mod httpconn;
pub mod message;
pub mod servconn;
pub mod slp;
pub mod transaction;
pub mod transport;
