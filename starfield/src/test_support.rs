//! Test utilities shared by unit tests (in `src/`) and integration tests
//! (in `tests/`). Compiled for tests and behind the `test-support` feature.

mod clock;
mod world;

pub use clock::MutableClock;
pub use world::{TestClient, TestWorld, quiet_settings};
