//! HTTP/2 flow control.
//!
//! Per-connection and per-stream credit are each mutex-protected and signalled by a
//! [`tokio::sync::Notify`] standing in for condition variable. A writer
//! reserving `n` bytes blocks until both the connection credit and the relevant
//! stream's credit are at least `n`, then decrements both atomically under the lock.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::Notify;

pub const DEFAULT_WINDOW: i64 = 65_535;

struct Credit {
    conn: i64,
    streams: HashMap<u32, i64>,
    initial_stream_window: i64,
}

pub struct FlowControl {
    credit: Mutex<Credit>,
    notify: Notify,
}

impl FlowControl {
    pub fn new() -> Self {
        Self {
            credit: Mutex::new(Credit {
                    conn: DEFAULT_WINDOW,
                    streams: HashMap::new(),
                    initial_stream_window: DEFAULT_WINDOW,
                }),
            notify: Notify::new(),
        }
    }

    fn stream_credit(credit: &mut Credit, stream_id: u32) -> i64 {
        *credit.streams.entry(stream_id).or_insert(credit.initial_stream_window)
    }

    /// Blocks until both the connection and `stream_id`'s window hold at least `n`
    /// bytes of credit, then decrements both by exactly `n`.
    pub async fn reserve(&self, stream_id: u32, n: u32) {
        let n = n as i64;
        loop {
            {
                let mut credit = self.credit.lock();
                let stream = Self::stream_credit(&mut credit, stream_id);
                if credit.conn >= n && stream >= n {
                    credit.conn -= n;
                    *credit.streams.get_mut(&stream_id).unwrap() -= n;
                    return;
                }
            }
            self.notify.notified().await;
        }
    }

    /// The most credit a single write to `stream_id` may currently claim without
    /// blocking, capped by both the connection and stream windows (used to size DATA
    /// frames alongside `MAX_FRAME_SIZE`, step 4).
    pub fn available(&self, stream_id: u32) -> i64 {
        let mut credit = self.credit.lock();
        let stream = Self::stream_credit(&mut credit, stream_id);
        credit.conn.min(stream).max(0)
    }

    /// WINDOW_UPDATE: `stream_id == 0` replenishes the connection window, otherwise the
    /// named stream's.
    pub fn on_window_update(&self, stream_id: u32, increment: u32) {
        {
            let mut credit = self.credit.lock();
            if stream_id == 0 {
                credit.conn += increment as i64;
            } else {
                let entry = credit.streams.entry(stream_id).or_insert(credit.initial_stream_window);
                *entry += increment as i64;
            }
        }
        self.notify.notify_waiters();
    }

    /// SETTINGS `INITIAL_WINDOW_SIZE = v` shifts every existing per-stream credit by
    /// `v - old_initial`.
    pub fn on_initial_window_size_change(&self, new_initial: u32) {
        let new_initial = new_initial as i64;
        {
            let mut credit = self.credit.lock();
            let delta = new_initial - credit.initial_stream_window;
            for v in credit.streams.values_mut() {
                *v += delta;
            }
            credit.initial_stream_window = new_initial;
        }
        self.notify.notify_waiters();
    }

    pub fn drop_stream(&self, stream_id: u32) {
        self.credit.lock().streams.remove(&stream_id);
    }
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn reserve_decrements_both_windows() {
        let fc = Arc::new(FlowControl::new());
        fc.reserve(1, 1000).await;
        assert_eq!(fc.available(1), DEFAULT_WINDOW - 1000);
    }

    #[tokio::test]
    async fn reserve_blocks_until_window_update() {
        let fc = Arc::new(FlowControl::new());
        fc.on_initial_window_size_change(10); // tiny window for the test

        let fc2 = fc.clone();
        let waiter = tokio::spawn(async move {
                fc2.reserve(1, 20).await;
            });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        fc.on_window_update(1, 50);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn initial_window_size_change_shifts_existing_streams() {
        let fc = FlowControl::new();
        fc.reserve(1, 100).await; // establishes stream 1 at 65535, minus 100
        fc.on_initial_window_size_change(1024);
        // 65435 + (1024 - 65535) == 924
        assert_eq!(fc.available(1), 924);
    }
}
