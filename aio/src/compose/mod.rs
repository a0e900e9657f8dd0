//! Operations built from single-shot socket operations.
//!
//! - Timeout-guarded operations race one submission against a [`Timeout`]
//!   and deliver exactly one callback, from whichever side wins.
//! - `send_all`/`recv_all` chain guarded vectored operations until every
//!   byte of an [`IoBufs`] has moved, an error occurs or the time budget
//!   runs out.
//!
//! [`Timeout`]: crate::Timeout
//! [`IoBufs`]: crate::IoBufs

mod all;
mod guarded;

pub use all::AllOutcome;
