//! The compressed tick representation used by the replay cache and the
//! `recovery_batch` wire frame (spec §3, §6).
//!
//! Field names are deliberately short (`s`, `p`, `v`, `t`) — this is the
//! on-wire/in-cache form that buys the ~10x memory reduction spec.md §3
//! calls for over a full `TickPoint`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedPoint {
    /// Standard-form symbol.
    pub s: String,
    pub p: f64,
    pub v: f64,
    pub t: i64,
}

impl CompressedPoint {
    pub fn new(s: impl Into<String>, p: f64, v: f64, t: i64) -> Self {
        Self {
            s: s.into(),
            p,
            v,
            t,
        }
    }
}
