//! In-memory container runtime for exercising the broker and sweeper.

mod fake_runtime;

pub use fake_runtime::{Behavior, Call, FakeRuntime};
