//! FTP retrieval.
//!
//! - **`connection`**: control connection state machine (login, `PASV`,
//!   `RETR`/`LIST`, data channel)
//! - **`reply`**: control reply, `PASV` and directory listing parsing

pub mod connection;
pub mod reply;
