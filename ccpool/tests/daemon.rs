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

// these tests drive a real daemon over a real socket, which the
// nodaemon build mode doesn't have
#![cfg(not(feature = "nodaemon"))]

use std::{env, fs};

use libccpool::{Config, DaemonClient, Reply, StashedFile};
use ntest::timeout;

mod support;

// nothing listens on the discard port, so transfers fail fast
const UNREACHABLE_URL: &str = "https://127.0.0.1:9/v1.0/cache/abcd-xyz";

#[test]
#[timeout(30000)]
fn submit_without_url_fails() {
    let daemon = support::daemon::Proc::new().expect("daemon to come up");
    let config = daemon.config();

    let mut client = DaemonClient::connect(&config).expect("connect to succeed");
    client.submit().expect("submit to succeed");
    let reply = client.next_reply();
    if reply != Reply::Failed {
        daemon.dump_log();
        panic!("expected a failed-request terminal, got {:?}", reply);
    }
}

#[test]
#[timeout(60000)]
fn unreachable_host_fails_and_session_is_reusable() {
    let daemon = support::daemon::Proc::new().expect("daemon to come up");
    let config = daemon.config();

    let mut client = DaemonClient::connect(&config).expect("connect to succeed");
    client.set_url(UNREACHABLE_URL).expect("set-url to succeed");
    client.add_header("X-USER-KEY: k").expect("add-header to succeed");
    client.submit().expect("submit to succeed");
    assert_eq!(client.next_reply(), Reply::Failed);

    // the same session takes another request; the reset cleared the
    // URL so an immediate submit fails without touching the network
    client.submit().expect("submit to succeed");
    assert_eq!(client.next_reply(), Reply::Failed);

    // and a full request works again too
    client.set_url(UNREACHABLE_URL).expect("set-url to succeed");
    client.submit().expect("submit to succeed");
    assert_eq!(client.next_reply(), Reply::Failed);
}

#[test]
#[timeout(60000)]
fn post_with_form_and_attachment_reaches_the_pool() {
    let daemon = support::daemon::Proc::new().expect("daemon to come up");
    let config = daemon.config();

    let share_name = format!("/ccpool-test-post-{}", std::process::id());
    let stashed =
        StashedFile::create(&share_name, b"\x7fELF payload").expect("stash to succeed");

    let mut client = DaemonClient::connect(&config).expect("connect to succeed");
    client.set_url(UNREACHABLE_URL).expect("set-url to succeed");
    client.add_form_field("data", b"{\"cpp_hash\":\"abcd\"}").expect("form field to succeed");
    client
        .add_form_attachment("object", &stashed, "obj.o")
        .expect("attachment to succeed");
    client.submit().expect("submit to succeed");

    // the daemon mapped the artifact and dispatched a POST; the
    // transfer itself fails on the dead port
    let reply = client.next_reply();
    if reply != Reply::Failed {
        daemon.dump_log();
        panic!("expected a failed-request terminal, got {:?}", reply);
    }
    drop(stashed);
}

#[test]
#[timeout(60000)]
fn concurrent_clients_all_get_terminals() {
    let daemon = support::daemon::Proc::new().expect("daemon to come up");

    let mut joins = vec![];
    for _ in 0..8 {
        let config = daemon.config();
        joins.push(std::thread::spawn(move || {
            let mut client = DaemonClient::connect(&config).expect("connect to succeed");
            client.set_url(UNREACHABLE_URL).expect("set-url to succeed");
            client.submit().expect("submit to succeed");
            client.next_reply()
        }));
    }
    for join in joins {
        assert_eq!(join.join().expect("client thread"), Reply::Failed);
    }
}

#[test]
#[timeout(60000)]
fn connect_launches_daemon_and_idle_timeout_reaps_it() {
    let tmp_dir = tempfile::Builder::new()
        .prefix("ccpool-test")
        .rand_bytes(20)
        .tempdir()
        .expect("tmp dir to build");
    let cache_dir = tmp_dir.path().join("cache");
    fs::create_dir_all(&cache_dir).expect("cache dir to build");
    let config = Config {
        cache_dir: Some(cache_dir.to_string_lossy().into_owned()),
        ..Default::default()
    };

    // under `cargo test` the current exe is the test binary, so point
    // the autolaunch at the real thing; shorten the idle timeout so
    // the reap is observable
    env::set_var("CCPOOL__INTERNAL__BIN", support::ccpool_bin());
    env::set_var("CCPOOL__INTERNAL__IDLE_TIMEOUT_MS", "500");

    let mut client = DaemonClient::connect(&config).expect("autolaunched connect to succeed");
    env::remove_var("CCPOOL__INTERNAL__IDLE_TIMEOUT_MS");

    let socket_path = libccpool::socket_path(&config).expect("socket path to resolve");
    assert!(socket_path.exists());

    client.submit().expect("submit to succeed");
    assert_eq!(client.next_reply(), Reply::Failed);
    drop(client);

    // with the client gone the daemon idles out and removes its
    // socket file on the way down
    support::wait_until(|| Ok(!socket_path.exists())).expect("daemon to idle out");
}
