//! HTTP/1.1 client protocol.
//!
//! # Architecture
//!
//! - **`connection`**: the response state machine, request dispatch and
//!   pipelining checks
//! - **`parser`**: status line, header and chunk size parsing
//! - **`writer`**: serializes outgoing requests
//!
//! Requests are written as soon as the scheduling policy allows; responses
//! are matched to them strictly in order:
//!
//! ```text
//!   sent: [ test HEAD ] [ GET /a ] [ GET /b ]
//!              ▲
//!              └── next response on the wire belongs here
//! ```

pub mod connection;
pub mod parser;
pub mod writer;
