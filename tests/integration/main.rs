//! Integration tests for the frontier
//!
//! These run the db worker against on-disk SQLite stores and the in-process
//! broker, playing the crawling worker by hand.

mod frontier_tests;
