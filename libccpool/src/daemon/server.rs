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

//! The daemon's single-threaded readiness event loop. It owns every
//! session, the job queue and the upstream pool bookkeeping; nothing
//! here blocks except the poll at the top of each iteration.

use std::{
    collections::HashMap,
    os::fd::AsFd as _,
    os::unix::{
        io::{AsRawFd as _, RawFd},
        net::UnixListener,
    },
    path::PathBuf,
    sync::{atomic::Ordering, Arc},
};

use anyhow::Context;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    consts,
    daemon::{
        pool::UpstreamPool,
        queue::JobQueue,
        session::{Drive, Session},
        stats::Counters,
    },
};

enum PollTarget {
    Listener,
    Notify,
    Session(RawFd),
}

pub struct Server {
    temp_dir: PathBuf,
    sessions: HashMap<RawFd, Session>,
    queue: JobQueue,
    pool: UpstreamPool,
    counters: Arc<Counters>,
    client_counter: u32,
}

impl Server {
    pub fn new(temp_dir: PathBuf, pool: UpstreamPool, counters: Arc<Counters>) -> Server {
        counters.pool_size.store(pool.size() as u32, Ordering::Relaxed);
        Server {
            temp_dir,
            sessions: HashMap::new(),
            queue: JobQueue::new(),
            pool,
            counters,
            client_counter: 0,
        }
    }

    /// Run until the idle timeout fires with nothing left to do. The
    /// listener is dropped early if we get close to the fd limit, in
    /// which case existing sessions drain and a replacement daemon is
    /// launched by the next client.
    #[instrument(skip_all)]
    pub fn run(&mut self, listener: UnixListener) -> anyhow::Result<()> {
        listener.set_nonblocking(true).context("setting listener non-blocking")?;
        let mut listener = Some(listener);

        let idle_timeout = consts::idle_timeout();
        let timeout = PollTimeout::try_from(idle_timeout.as_millis() as i32)
            .unwrap_or(PollTimeout::MAX);

        loop {
            // build this iteration's readiness set: the master socket,
            // the pool's completion wakeup, and every client session
            let mut targets = vec![];
            let mut poll_fds = vec![];
            if let Some(l) = &listener {
                targets.push(PollTarget::Listener);
                poll_fds.push(PollFd::new(l.as_fd(), PollFlags::POLLIN));
            }
            targets.push(PollTarget::Notify);
            poll_fds.push(PollFd::new(self.pool.notify_fd(), PollFlags::POLLIN));
            for (fd, session) in self.sessions.iter() {
                targets.push(PollTarget::Session(*fd));
                poll_fds.push(PollFd::new(session.stream().as_fd(), session.poll_interest()));
            }

            let nready = match poll(&mut poll_fds, timeout) {
                Ok(n) => n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e).context("polling"),
            };

            if nready == 0 && self.pool.active_count() == 0 && self.sessions.is_empty() {
                info!("no daemon activity for {:?}", idle_timeout);
                return Ok(());
            }

            let ready: Vec<(usize, PollFlags)> = poll_fds
                .iter()
                .enumerate()
                .filter_map(|(i, pfd)| {
                    let revents = pfd.revents().unwrap_or(PollFlags::empty());
                    if revents.is_empty() { None } else { Some((i, revents)) }
                })
                .collect();
            drop(poll_fds);

            for (i, revents) in ready {
                match targets[i] {
                    PollTarget::Listener => self.accept_clients(&mut listener),
                    PollTarget::Notify => {
                        // handled below, completions are drained every
                        // iteration
                    }
                    PollTarget::Session(fd) => {
                        let hangup = revents.intersects(
                            PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL,
                        );
                        let parked = self
                            .sessions
                            .get(&fd)
                            .map(|s| s.is_waiting() || s.is_in_progress())
                            .unwrap_or(false);
                        if hangup && parked {
                            // a parked session does no I/O of its own,
                            // so a dead peer is only visible here
                            self.teardown(fd, None);
                        } else {
                            self.drive_session(fd);
                        }
                    }
                }
            }

            self.handle_completions();
            self.dispatch_jobs();
        }
    }

    #[instrument(skip_all)]
    fn accept_clients(&mut self, listener: &mut Option<UnixListener>) {
        let Some(l) = listener.as_ref() else {
            return;
        };
        loop {
            match l.accept() {
                Ok((stream, _addr)) => {
                    let fd = stream.as_raw_fd();
                    let client_number = self.client_counter;
                    self.client_counter += 1;

                    match Session::new(stream, client_number) {
                        Ok(session) => {
                            self.sessions.insert(fd, session);
                        }
                        Err(e) => {
                            error!("[{}] configuring new client socket: {:?}", client_number, e);
                            continue;
                        }
                    }
                    self.counters.clients_total.fetch_add(1, Ordering::Relaxed);
                    self.counters.active_clients.fetch_add(1, Ordering::Relaxed);
                    info!("[{}] accepted new client connection", client_number);

                    // Enough is enough! If we're about to run out of
                    // file descriptors then we stop accepting and let
                    // another daemon take over.
                    if self.sessions.len() >= consts::MAX_CLIENTS
                        || fd as usize >= consts::MAX_CLIENTS
                    {
                        warn!(
                            "connected clients are nearing the file descriptor limit; \
                             this daemon stops accepting and another must take over"
                        );
                        *listener = None;
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("daemon cannot accept from master socket: {}", e);
                    *listener = None;
                    break;
                }
            }
        }
        info!("daemon now has {} client connections", self.sessions.len());
    }

    /// Run one session's state machine until it yields, servicing
    /// whatever it asks of the loop.
    fn drive_session(&mut self, fd: RawFd) {
        loop {
            let Some(session) = self.sessions.get_mut(&fd) else {
                return;
            };
            match session.drive() {
                Drive::Blocked => return,
                Drive::Submit => {
                    let is_post = session.is_post();
                    self.queue.push(fd, is_post);
                    return;
                }
                Drive::Finished { was_post, elapsed } => {
                    if let Some(elapsed) = elapsed {
                        if was_post {
                            self.counters.post_overall.record(elapsed);
                        } else {
                            self.counters.get_overall.record(elapsed);
                        }
                    }
                    // fall through: the client may already have
                    // buffered its next request
                }
                Drive::Hangup => {
                    self.teardown(fd, None);
                    return;
                }
                Drive::Dead(e) => {
                    self.teardown(fd, Some(e));
                    return;
                }
            }
        }
    }

    /// Remove a session and release everything it owns. The socket,
    /// the shared artifact mappings and any undelivered attachment
    /// temp files all go when the session drops.
    fn teardown(&mut self, fd: RawFd, err: Option<anyhow::Error>) {
        let Some(session) = self.sessions.remove(&fd) else {
            return;
        };
        match err {
            Some(e) => warn!(
                "[{}] closing client connection in {:?}: {:?}",
                session.client_number,
                session.state(),
                e
            ),
            None => info!("[{}] closing client connection", session.client_number),
        }

        if session.is_waiting() {
            self.queue.remove(fd);
        }
        if session.is_in_progress() {
            // the completion will find no session and discard the
            // response
            self.pool.forget_session(fd);
        }
        self.counters.active_clients.fetch_sub(1, Ordering::Relaxed);
        info!("{} client connections remain", self.sessions.len());
    }

    /// Collect finished transfers, move their responses into the
    /// owning sessions and start the send phase.
    fn handle_completions(&mut self) {
        for completed in self.pool.drain_completions() {
            if completed.is_post {
                self.counters.post_requests.fetch_add(1, Ordering::Relaxed);
                self.counters.post_upstream.record(completed.elapsed);
            } else {
                self.counters.get_requests.fetch_add(1, Ordering::Relaxed);
                self.counters.get_upstream.record(completed.elapsed);
            }

            let Some(fd) = completed.session else {
                info!("upstream request completed, but client already died");
                continue;
            };
            let Some(session) = self.sessions.get_mut(&fd) else {
                info!("upstream request completed, but client already died");
                continue;
            };

            match completed.result {
                Ok(response) => {
                    info!(
                        "[{}:{}] upstream request completed",
                        session.client_number, session.job_number
                    );
                    session.attach_response(Some(response));
                }
                Err(e) => {
                    info!(
                        "[{}:{}] upstream request failed: {:?}",
                        session.client_number, session.job_number, e
                    );
                    session.attach_response(None);
                }
            }
            // the socket is almost certainly writable right now, so
            // start streaming without waiting for the next poll
            self.drive_session(fd);
        }
        self.counters.active_upstream.store(self.pool.active_count() as u32, Ordering::Relaxed);
    }

    /// Match waiting jobs to free upstream handles, GETs first.
    fn dispatch_jobs(&mut self) {
        while !self.queue.is_empty() {
            let Some(handle) = self.pool.free_handle() else {
                break;
            };
            let Some(fd) = self.queue.pop() else {
                break;
            };
            let Some(session) = self.sessions.get_mut(&fd) else {
                // jobs are dequeued at teardown, but be tolerant
                debug!("queued job for a session that no longer exists");
                continue;
            };

            let spec = session.request_spec(self.temp_dir.clone());
            info!(
                "[{}:{}]<{}> dispatched job to upstream handle: {}",
                session.client_number, session.job_number, handle, spec.url
            );
            session.mark_in_progress();
            if !self.pool.dispatch(handle, fd, spec) {
                session.attach_response(None);
                self.drive_session(fd);
            }
        }
        self.counters.active_upstream.store(self.pool.active_count() as u32, Ordering::Relaxed);
        debug!("daemon has {} jobs left waiting", self.queue.len());
    }
}
