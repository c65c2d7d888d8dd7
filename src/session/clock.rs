//! Time abstraction for testable session aging.
//!
//! This module provides a mockable `Instant` type so idle-timeout and
//! expiry behavior can be verified without waiting for real time to pass.
//!
//! In production, this uses `std::time::Instant` directly.
//! In tests, this uses `mock_instant::Instant` which can be advanced via
//! `MockClock`.
//!
//! # Example (in tests)
//!
//! ```ignore
//! use mock_instant::MockClock;
//! use std::time::Duration;
//!
//! // Create a session
//! let table = SessionTable::new(&config);
//! table.create(key, v4_dst).unwrap();
//!
//! // Advance time past the UDP timeout
//! MockClock::advance(Duration::from_secs(61));
//!
//! // Now the reaper removes the expired session
//! let removed = table.reap(Instant::now());
//! assert_eq!(removed, 1);
//! ```

// In tests, use mock_instant for time control
#[cfg(test)]
pub use mock_instant::Instant;

// In production, use standard library Instant
#[cfg(not(test))]
pub use std::time::Instant;

// Re-export MockClock for tests
#[cfg(test)]
pub use mock_instant::MockClock;
