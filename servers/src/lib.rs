//! Runtime wiring for the leaderboard binaries: configuration, logging, the
//! aggregation worker and the read API.

pub mod leaderboard_logic;
