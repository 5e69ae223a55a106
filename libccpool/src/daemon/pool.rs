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

//! The upstream connection pool: a fixed set of reusable HTTPS
//! handles, each a worker thread wrapping one persistent reqwest
//! client. The event loop hands a handle a job over its channel and
//! gets the finished response back over a shared completion channel;
//! a byte on the notify socket folds "a completion is waiting" into
//! the loop's poll set. At most one request is in flight per handle.
//!
//! All pool bookkeeping (which handle is active, which session it is
//! serving) lives on the event-loop thread; a worker owns nothing but
//! the transfer it is currently running.

use std::{
    io::{Read as _, Write as _},
    os::fd::{AsFd, BorrowedFd},
    os::unix::{io::RawFd, net::UnixStream},
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, span, warn, Level};

use crate::{
    response::ServerResponse,
    upstream,
    upstream::RequestSpec,
};

struct Completion {
    handle: usize,
    result: anyhow::Result<ServerResponse>,
}

/// A finished transfer, as handed back to the event loop.
pub struct Completed {
    /// The session the handle was serving, unless that client died
    /// mid-transfer, in which case the response is for the bin.
    pub session: Option<RawFd>,
    pub is_post: bool,
    pub elapsed: Duration,
    pub result: anyhow::Result<ServerResponse>,
}

struct UpstreamHandle {
    number: usize,
    active: bool,
    is_post: bool,
    session: Option<RawFd>,
    dispatched_at: Instant,
    job_tx: Sender<RequestSpec>,
}

pub struct UpstreamPool {
    handles: Vec<UpstreamHandle>,
    completion_rx: Receiver<Completion>,
    notify_rx: UnixStream,
    active: usize,
}

impl UpstreamPool {
    /// Spin up `size` handles. Failure to build a client here is a
    /// fatal startup error for the daemon.
    pub fn new(size: u32) -> anyhow::Result<UpstreamPool> {
        let (completion_tx, completion_rx) = crossbeam_channel::unbounded();
        let (notify_tx, notify_rx) = UnixStream::pair().context("creating notify socket pair")?;
        notify_rx.set_nonblocking(true).context("setting notify socket non-blocking")?;

        let mut handles = Vec::with_capacity(size as usize);
        for number in 0..size as usize {
            let client = upstream::build_client()
                .with_context(|| format!("building upstream client <{number}>"))?;
            let (job_tx, job_rx) = crossbeam_channel::unbounded();
            let completion_tx = completion_tx.clone();
            let notify_tx = notify_tx.try_clone().context("cloning notify socket")?;
            thread::spawn(move || {
                let _s = span!(Level::INFO, "upstream", h = number).entered();
                worker(number, client, job_rx, completion_tx, notify_tx);
            });
            handles.push(UpstreamHandle {
                number,
                active: false,
                is_post: false,
                session: None,
                dispatched_at: Instant::now(),
                job_tx,
            });
            info!("<{}> created new upstream handle", number);
        }

        Ok(UpstreamPool { handles, completion_rx, notify_rx, active: 0 })
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    pub fn active_count(&self) -> usize {
        self.active
    }

    /// The fd the event loop watches for completion wakeups.
    pub fn notify_fd(&self) -> BorrowedFd<'_> {
        self.notify_rx.as_fd()
    }

    pub fn free_handle(&self) -> Option<usize> {
        self.handles.iter().find(|h| !h.active).map(|h| h.number)
    }

    /// Hand a job to an inactive handle. The worker picks it up
    /// immediately; the channel send cannot block. Returns false if
    /// the worker is gone, in which case the job was not taken and
    /// the caller should fail the request.
    pub fn dispatch(&mut self, handle: usize, session: RawFd, spec: RequestSpec) -> bool {
        let is_post = spec.form.is_some();
        let h = &mut self.handles[handle];
        debug_assert!(!h.active);
        if h.job_tx.send(spec).is_err() {
            warn!("<{}> upstream worker is dead, failing job", h.number);
            return false;
        }
        h.active = true;
        h.is_post = is_post;
        h.session = Some(session);
        h.dispatched_at = Instant::now();
        self.active += 1;
        true
    }

    /// Null the back-reference from any handle serving this session;
    /// its completion will be discarded.
    pub fn forget_session(&mut self, session: RawFd) {
        for h in self.handles.iter_mut() {
            if h.session == Some(session) {
                debug!("<{}> detaching dead client from in-flight transfer", h.number);
                h.session = None;
            }
        }
    }

    /// Collect every finished transfer, returning each handle to the
    /// free pool.
    pub fn drain_completions(&mut self) -> Vec<Completed> {
        // drain the notify socket; it only ever means "check the
        // channel", so spurious bytes are harmless
        let mut scratch = [0; 64];
        loop {
            match (&self.notify_rx).read(&mut scratch) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("reading notify socket: {}", e);
                    break;
                }
            }
        }

        let mut completed = vec![];
        while let Ok(Completion { handle, result }) = self.completion_rx.try_recv() {
            let h = &mut self.handles[handle];
            h.active = false;
            self.active -= 1;
            completed.push(Completed {
                session: h.session.take(),
                is_post: h.is_post,
                elapsed: h.dispatched_at.elapsed(),
                result,
            });
        }
        completed
    }
}

fn worker(
    number: usize,
    client: reqwest::blocking::Client,
    job_rx: Receiver<RequestSpec>,
    completion_tx: Sender<Completion>,
    notify_tx: UnixStream,
) {
    for spec in job_rx.iter() {
        debug!("<{}> performing {}", number, spec.url);
        let result = upstream::perform(&client, spec);
        if let Err(e) = &result {
            info!("<{}> upstream request failed: {:?}", number, e);
        }
        if completion_tx.send(Completion { handle: number, result }).is_err() {
            // the daemon is shutting down
            return;
        }
        if let Err(e) = (&notify_tx).write(&[1]) {
            warn!("<{}> waking event loop: {}", number, e);
        }
    }
}
