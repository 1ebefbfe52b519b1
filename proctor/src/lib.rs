//! Client-side core of a proctored exam attempt.
//!
//! The crate keeps one authoritative session record, enforces a wall-clock
//! deadline, records integrity violations, captures monitoring frames and
//! answer pages, and delivers exactly one final submission. All I/O goes
//! through the collaborator traits in [`session::collaborators`].

pub mod session;

#[cfg(test)]
pub mod test_utils;
