// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Daemon counters. Written only from the event-loop thread, read as
//! snapshots by the signal-handler thread when SIGUSR1 asks for a
//! status dump, which is why everything here is an atomic rather than
//! plain fields behind a lock.

use std::{
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::Duration,
};

/// Low / average / high response times, kept in microseconds.
#[derive(Default)]
pub struct TimeStats {
    low_us: AtomicU64,
    high_us: AtomicU64,
    avg_us: AtomicU64,
    samples: AtomicU64,
}

impl TimeStats {
    pub fn record(&self, elapsed: Duration) {
        let us = elapsed.as_micros() as u64;

        let low = self.low_us.load(Ordering::Relaxed);
        if low == 0 || us < low {
            self.low_us.store(us, Ordering::Relaxed);
        }
        if us > self.high_us.load(Ordering::Relaxed) {
            self.high_us.store(us, Ordering::Relaxed);
        }

        let n = self.samples.load(Ordering::Relaxed) + 1;
        let avg = self.avg_us.load(Ordering::Relaxed);
        self.avg_us.store(((n - 1) * avg + us) / n, Ordering::Relaxed);
        self.samples.store(n, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.low_us.store(0, Ordering::Relaxed);
        self.high_us.store(0, Ordering::Relaxed);
        self.avg_us.store(0, Ordering::Relaxed);
        self.samples.store(0, Ordering::Relaxed);
    }

    fn secs(&self) -> (f64, f64, f64) {
        let to_s = |us: u64| us as f64 / 1_000_000.0;
        (
            to_s(self.low_us.load(Ordering::Relaxed)),
            to_s(self.avg_us.load(Ordering::Relaxed)),
            to_s(self.high_us.load(Ordering::Relaxed)),
        )
    }
}

#[derive(Default)]
pub struct Counters {
    /// Clients ever accepted, and how many are still connected.
    pub clients_total: AtomicU32,
    pub active_clients: AtomicU32,

    /// Size of the upstream pool and how many handles are in use.
    pub pool_size: AtomicU32,
    pub active_upstream: AtomicU32,

    /// Completed upstream requests by method.
    pub get_requests: AtomicU32,
    pub post_requests: AtomicU32,

    /// Upstream-only transfer time vs whole submit-to-terminal time.
    pub get_upstream: TimeStats,
    pub post_upstream: TimeStats,
    pub get_overall: TimeStats,
    pub post_overall: TimeStats,
}

impl Counters {
    /// Dump a status report to stderr (SIGUSR1).
    pub fn dump(&self) {
        eprintln!("ccpool daemon status");
        eprintln!(
            "client connections: {} ({} still connected)",
            self.clients_total.load(Ordering::Relaxed),
            self.active_clients.load(Ordering::Relaxed),
        );
        eprintln!(
            "server connections: {} ({} currently in use)",
            self.pool_size.load(Ordering::Relaxed),
            self.active_upstream.load(Ordering::Relaxed),
        );
        eprintln!(
            "completed requests: GET={} POST={}",
            self.get_requests.load(Ordering::Relaxed),
            self.post_requests.load(Ordering::Relaxed),
        );
        eprintln!("response times:  low   average   high");
        for (label, stats) in [
            ("GET (upstream)  ", &self.get_upstream),
            ("GET (overall)   ", &self.get_overall),
            ("POST (upstream) ", &self.post_upstream),
            ("POST (overall)  ", &self.post_overall),
        ] {
            let (low, avg, high) = stats.secs();
            eprintln!("{label}{low:.6} {avg:.6} {high:.6}");
        }
    }

    /// Zero the request counters and times (SIGUSR2). Connection
    /// gauges are left alone, they describe live state.
    pub fn reset(&self) {
        self.get_requests.store(0, Ordering::Relaxed);
        self.post_requests.store(0, Ordering::Relaxed);
        self.get_upstream.reset();
        self.post_upstream.reset();
        self.get_overall.reset();
        self.post_overall.reset();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn time_stats_track_low_avg_high() {
        let stats = TimeStats::default();
        stats.record(Duration::from_micros(100));
        stats.record(Duration::from_micros(300));
        stats.record(Duration::from_micros(200));

        let (low, avg, high) = stats.secs();
        assert!((low - 0.0001).abs() < 1e-9);
        assert!((high - 0.0003).abs() < 1e-9);
        assert!(avg > 0.0 && avg < 0.0003);
    }

    #[test]
    fn reset_clears_request_stats() {
        let counters = Counters::default();
        counters.get_requests.store(7, Ordering::Relaxed);
        counters.get_overall.record(Duration::from_millis(5));
        counters.active_clients.store(3, Ordering::Relaxed);

        counters.reset();
        assert_eq!(counters.get_requests.load(Ordering::Relaxed), 0);
        assert_eq!(counters.get_overall.secs(), (0.0, 0.0, 0.0));
        // gauges survive
        assert_eq!(counters.active_clients.load(Ordering::Relaxed), 3);
    }
}
