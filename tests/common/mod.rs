#![allow(dead_code)]

use std::sync::mpsc;
use std::time::Duration;

use rand::Rng;

/// Initializes test logging once per test binary. `RUST_LOG` overrides the default filter.
pub fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,futures_conductor=trace"));
    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

/// A one-shot gate: tasks block on the receiving side until the test opens it.
pub fn gate() -> (mpsc::Sender<()>, mpsc::Receiver<()>) {
  mpsc::channel()
}

/// Random task duration in `[min_ms, max_ms)`.
pub fn jitter(min_ms: u64, max_ms: u64) -> Duration {
  Duration::from_millis(rand::rng().random_range(min_ms..max_ms))
}

#[derive(Debug)]
pub struct ServiceDown(pub &'static str);

impl std::fmt::Display for ServiceDown {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "service {} is down", self.0)
  }
}

impl std::error::Error for ServiceDown {}
