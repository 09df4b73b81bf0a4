//! Console observer: tracing output plus a coarse progress line.

use std::sync::atomic::{AtomicU8, Ordering};

use canflash_core::{TracingObserver, UpdateEvent, UpdateObserver};

/// Prints progress every 10% and forwards everything to tracing.
pub struct ConsoleObserver {
    inner: TracingObserver,
    last_decile: AtomicU8,
}

impl ConsoleObserver {
    pub fn new() -> Self {
        Self {
            inner: TracingObserver,
            last_decile: AtomicU8::new(0),
        }
    }
}

impl UpdateObserver for ConsoleObserver {
    fn on_event(&self, event: &UpdateEvent) {
        self.inner.on_event(event);

        match event {
            UpdateEvent::Progress {
                acknowledged,
                total,
                fraction,
            } => {
                let decile = (fraction * 10.0).floor() as u8;
                if decile > self.last_decile.swap(decile, Ordering::Relaxed) {
                    println!(
                        "[{:<10}] {:>3.0}%  {}/{} bytes",
                        "#".repeat(decile as usize),
                        fraction * 100.0,
                        acknowledged,
                        total
                    );
                }
            }
            UpdateEvent::Retry {
                chunk, attempt, max, ..
            } => {
                println!("  chunk {} resent ({}/{})", chunk, attempt, max);
            }
            UpdateEvent::PhaseChanged { to, .. } => {
                if to.is_terminal() {
                    self.last_decile.store(0, Ordering::Relaxed);
                }
            }
            _ => {}
        }
    }
}
