//! Hard caps on input sizes. Anything beyond these is refused with
//! `EngineError::LimitExceeded` before it touches state or the WAL.

pub const MAX_INTERVIEWERS: usize = 10_000;
pub const MAX_RULES_PER_INTERVIEWER: usize = 256;
pub const MAX_EXCLUSIONS_PER_INTERVIEWER: usize = 10_000;
pub const MAX_CANDIDATES: usize = 1_000_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_TOKEN_LEN: usize = 256;

/// Widest availability query accepted, in days.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 62;
/// Longest single blackout, in days.
pub const MAX_BLACKOUT_DAYS: i64 = 366;

/// Longest accepted request line on the wire, in bytes.
pub const MAX_LINE_LEN: usize = 64 * 1024;
