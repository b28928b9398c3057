//! Provides a size constrained LRU cache whose entries decay after a wall-clock TTL.
//!
//! A [DecayingLruCache](DecayingLruCache) behaves like a bounded map: once the configured
//! capacity is reached, the least recently used entry is dropped to make room. On top of
//! the classic recency eviction, every entry carries its insertion timestamp and is
//! removed once it is older than the configured TTL - either lazily when a lookup
//! encounters it, or proactively by the background *reaper* which wakes periodically and
//! works through a time-ordered log of insertions.
//!
//! The combination keeps the proxy's staleness bounded (a cached reply is never served
//! beyond its TTL) without ever blocking foreground requests behind a full scan.
mod decay;
#[cfg(test)]
mod property_tests;

pub use decay::DecayingLruCache;
