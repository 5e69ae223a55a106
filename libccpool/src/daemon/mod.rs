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

use std::{
    env,
    os::fd::AsRawFd as _,
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Context};
use nix::sys::{
    signal::{signal, SigHandler, Signal},
    socket::{self, Backlog, SockFlag, SockType, UnixAddr},
};
use tracing::{info, instrument, warn};

mod pool;
mod queue;
mod server;
mod session;
mod signals;
mod stats;

use crate::{config, consts};

/// Run the daemon until it shuts down on its own. A startup failure
/// (socket bind, pool initialization) is an error here, which the
/// binary maps to exit code 1; an idle timeout or signal exit is
/// status 0.
#[instrument(skip_all)]
pub fn run(config: config::Config, socket: PathBuf) -> anyhow::Result<()> {
    if let Ok(daemonize) = env::var(consts::AUTODAEMONIZE_VAR) {
        if daemonize == "true" {
            env::remove_var(consts::AUTODAEMONIZE_VAR); // avoid looping

            let pid_file = socket.with_file_name("daemonized-ccpool.pid");

            info!("daemonizing with pid_file={:?}", pid_file);
            daemonize::Daemonize::new().pid_file(pid_file).start().context("daemonizing")?;
        }
    }

    info!("\n\n======================== STARTING DAEMON ============================\n\n");

    // Client crashes surface through recv/send on their sockets, not
    // as a process-killing SIGPIPE.
    // Safety: SigIgn installs no handler code.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }.context("ignoring SIGPIPE")?;

    let listener = bind_socket(&socket)?;
    info!("listening on socket at {:?}", socket);

    let pool =
        pool::UpstreamPool::new(config.connections()).context("initializing upstream pool")?;
    info!("upstream pool ready with {} handles", pool.size());

    let counters = Arc::new(stats::Counters::default());

    // spawn the signal handler thread in the background
    signals::Handler::new(socket.clone(), Arc::clone(&counters)).spawn()?;

    let mut server = server::Server::new(config.temp_dir(), pool, counters);
    let result = server.run(listener);

    if let Err(e) = std::fs::remove_file(&socket) {
        warn!("cleaning up socket on exit: {}", e);
    }
    info!("daemon exiting");

    result
}

/// Bind the master socket with the configured backlog. A stale socket
/// file left by a dead daemon is taken over; a live daemon on the
/// same socket is a startup failure.
fn bind_socket(path: &Path) -> anyhow::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("creating cache directory")?;
    }

    loop {
        let fd = socket::socket(
            socket::AddressFamily::Unix,
            SockType::Stream,
            SockFlag::empty(),
            None,
        )
        .context("creating master socket")?;
        let addr = UnixAddr::new(path).context("building socket address")?;

        match socket::bind(fd.as_raw_fd(), &addr) {
            Ok(()) => {
                let backlog =
                    Backlog::new(consts::LISTEN_BACKLOG).context("building listen backlog")?;
                socket::listen(&fd, backlog).context("listening on master socket")?;
                return Ok(UnixListener::from(fd));
            }
            Err(nix::errno::Errno::EADDRINUSE) => {
                // somebody else has the socket already; if it is dead
                // we can delete it and try again
                info!("the named socket already exists");
                if UnixStream::connect(path).is_ok() {
                    return Err(anyhow!("another daemon is already running on {:?}", path));
                }
                info!("removing dead named socket");
                std::fs::remove_file(path).context("removing dead socket")?;
            }
            Err(e) => return Err(e).context("binding master socket"),
        }
    }
}
