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

use std::time;

pub const BUF_SIZE: usize = 1024 * 16;

/// Hard cap on a single upstream transfer. High enough not to break
/// largish transfers over slow connections, low enough that a wedged
/// server cannot pin a pool handle forever.
pub const UPSTREAM_TIMEOUT: time::Duration = time::Duration::from_secs(10 * 60);

/// The daemon exits after this long with no connected clients and no
/// upstream work.
pub const IDLE_TIMEOUT: time::Duration = time::Duration::from_secs(10 * 60);

pub const LISTEN_BACKLOG: i32 = 50;

/// Stop accepting new clients once this many are connected (or a new
/// fd number reaches it); a replacement daemon takes over. Comfortably
/// below the usual 1024 descriptor limit.
pub const MAX_CLIENTS: usize = 900;

/// How long and how often a client retries connecting after launching
/// a fresh daemon.
pub const CONNECT_RETRY_INTERVAL: time::Duration = time::Duration::from_millis(10);
pub const CONNECT_RETRIES: usize = 200;

/// Size of the upstream connection pool when neither the config file
/// nor CCPOOL_DAEMON_CONNECTIONS says otherwise.
pub const DEFAULT_POOL_SIZE: u32 = 8;

// If set to "true", the daemon will autodaemonize after launch.
pub const AUTODAEMONIZE_VAR: &str = "CCPOOL__INTERNAL__AUTODAEMONIZE";

// Overrides the idle timeout, in milliseconds. For tests only: a
// daemon that exits in ten minutes makes for a slow test suite.
pub const IDLE_TIMEOUT_VAR: &str = "CCPOOL__INTERNAL__IDLE_TIMEOUT_MS";

// Overrides the binary the client launches for a missing daemon.
// For tests only: under `cargo test` the current exe is the test
// harness, not ccpool.
pub const BIN_VAR: &str = "CCPOOL__INTERNAL__BIN";

pub fn idle_timeout() -> time::Duration {
    match std::env::var(IDLE_TIMEOUT_VAR) {
        Ok(ms) => match ms.parse::<u64>() {
            Ok(ms) => time::Duration::from_millis(ms),
            Err(_) => IDLE_TIMEOUT,
        },
        Err(_) => IDLE_TIMEOUT,
    }
}
