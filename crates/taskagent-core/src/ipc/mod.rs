//! NDJSON protocol between the control process and worker processes.
//!
//! Every message is one JSON object per line. Worker-to-parent messages are
//! tagged by `type`; parent-to-worker messages are tagged by `action`.
//! Decoding is tolerant: unknown kinds come back as [`Inbound::Unknown`] so
//! the receiver can warn and carry on.

mod codec;
mod types;

pub use codec::{decode_parent_line, decode_worker_line, encode_line};
pub use types::*;
