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

//! The per-client session: all state for one connected client and the
//! cooperative state machine that drives it. Each call to [`Session::drive`]
//! runs until the socket would block, then yields; the explicit state
//! survives across readiness returns, which is the whole trick.

use std::{
    io::{Read as _, Write as _},
    os::unix::net::UnixStream,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use byteorder::{ByteOrder, LittleEndian};
use ccpool_protocol::{Reply, RequestCode};
use nix::poll::PollFlags;
use tracing::{debug, info, warn};

use crate::{
    response::ServerResponse,
    share::SharedMapping,
    upstream::{FormAttachment, FormPayload},
};

/// The state-machine cursor. Receive states consume request frames,
/// the transit states wait on the upstream pool, send states stream
/// response frames back, and Reset returns the session to fresh.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DfaState {
    RecvInit,
    RecvSize,
    RecvUrl,
    RecvHeader,
    RecvFormName,
    RecvFormData,
    RecvAttachmentName,
    RecvAttachmentFile,
    RecvAttachmentFilename,
    RecvAttachmentComplete,
    Waiting,
    InProgress,
    SendInit,
    SendDataHeader,
    SendDataBody,
    SendAttachmentHeader,
    SendAttachmentFilename,
    SendAttachmentTmpfilename,
    SendDrDone,
    Reset,
}

/// Why `drive` returned control to the event loop.
pub enum Drive {
    /// I/O would block; wait for the next readiness event.
    Blocked,
    /// The client submitted a request; enqueue this session.
    Submit,
    /// A response finished streaming; the session reset itself.
    Finished { was_post: bool, elapsed: Option<Duration> },
    /// The client hung up cleanly.
    Hangup,
    /// A wire violation or socket error; tear the session down.
    Dead(anyhow::Error),
}

enum Io<T> {
    Ready(T),
    Blocked,
    Disconnected,
}

pub struct Session {
    stream: UnixStream,
    pub client_number: u32,
    pub job_number: u32,

    state: DfaState,
    next_state: DfaState,

    // receive scratch
    recv_buf: Vec<u8>,
    recv_filled: usize,
    recv_active: bool,
    pending_size: usize,
    stashed: [Option<Vec<u8>>; 3],

    // the request under construction
    pub url: Option<String>,
    pub headers: Vec<String>,
    pub fields: Vec<(String, Vec<u8>)>,
    pub attachments: Vec<FormAttachment>,
    request_time: Option<Instant>,

    // the response being streamed back
    response: Option<ServerResponse>,
    response_begun: bool,
    part_cursor: usize,
    dr: Option<Reply>,

    // send scratch
    send_buf: Vec<u8>,
    send_off: usize,
    send_active: bool,
}

impl Session {
    pub fn new(stream: UnixStream, client_number: u32) -> anyhow::Result<Session> {
        stream.set_nonblocking(true).context("setting client socket non-blocking")?;
        Ok(Session {
            stream,
            client_number,
            job_number: 0,
            state: DfaState::RecvInit,
            next_state: DfaState::RecvInit,
            recv_buf: vec![],
            recv_filled: 0,
            recv_active: false,
            pending_size: 0,
            stashed: [None, None, None],
            url: None,
            headers: vec![],
            fields: vec![],
            attachments: vec![],
            request_time: None,
            response: None,
            response_begun: false,
            part_cursor: 0,
            dr: None,
            send_buf: vec![],
            send_off: 0,
            send_active: false,
        })
    }

    pub fn state(&self) -> DfaState {
        self.state
    }

    pub fn is_waiting(&self) -> bool {
        self.state == DfaState::Waiting
    }

    pub fn is_in_progress(&self) -> bool {
        self.state == DfaState::InProgress
    }

    pub fn is_post(&self) -> bool {
        !self.fields.is_empty() || !self.attachments.is_empty()
    }

    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// What the poll loop should watch this socket for. In the
    /// transit states we watch nothing but still learn about hangups
    /// through POLLHUP/POLLERR.
    pub fn poll_interest(&self) -> PollFlags {
        match self.state {
            DfaState::Waiting | DfaState::InProgress => PollFlags::empty(),
            DfaState::SendInit
            | DfaState::SendDataHeader
            | DfaState::SendDataBody
            | DfaState::SendAttachmentHeader
            | DfaState::SendAttachmentFilename
            | DfaState::SendAttachmentTmpfilename
            | DfaState::SendDrDone
            | DfaState::Reset => PollFlags::POLLOUT,
            _ => PollFlags::POLLIN,
        }
    }

    /// The event loop promotes a waiting session when its job is
    /// handed to an upstream handle.
    pub fn mark_in_progress(&mut self) {
        self.state = DfaState::InProgress;
    }

    /// Install the finished upstream result and switch the session
    /// into the send phase. `None` means the transfer itself failed
    /// and the client gets the failed-request terminal.
    pub fn attach_response(&mut self, response: Option<ServerResponse>) {
        self.response = response;
        self.response_begun = false;
        self.part_cursor = 0;
        self.state = DfaState::SendInit;
    }

    /// Snapshot the request for dispatch to an upstream handle.
    pub fn request_spec(&self, temp_dir: std::path::PathBuf) -> crate::upstream::RequestSpec {
        let form = if self.is_post() {
            Some(FormPayload {
                fields: self.fields.clone(),
                attachments: self
                    .attachments
                    .iter()
                    .map(|a| FormAttachment {
                        field_name: a.field_name.clone(),
                        filename: a.filename.clone(),
                        mapping: Arc::clone(&a.mapping),
                    })
                    .collect(),
            })
        } else {
            None
        };
        crate::upstream::RequestSpec {
            url: self.url.clone().unwrap_or_default(),
            headers: self.headers.clone(),
            form,
            temp_dir,
        }
    }

    /// Run the state machine until its I/O would block or it needs
    /// the event loop to act.
    pub fn drive(&mut self) -> Drive {
        loop {
            match self.state {
                DfaState::RecvInit => {
                    // each frame starts with a single code byte
                    let opcode = match self.fill_recv(1) {
                        Ok(Io::Ready(buf)) => buf[0],
                        Ok(Io::Blocked) => return Drive::Blocked,
                        Ok(Io::Disconnected) => return Drive::Hangup,
                        Err(e) => return Drive::Dead(e),
                    };
                    match RequestCode::try_from(opcode) {
                        Ok(RequestCode::SetUrl) => {
                            self.state = DfaState::RecvSize;
                            self.next_state = DfaState::RecvUrl;
                        }
                        Ok(RequestCode::AddHeader) => {
                            self.state = DfaState::RecvSize;
                            self.next_state = DfaState::RecvHeader;
                        }
                        Ok(RequestCode::FormField) => {
                            self.state = DfaState::RecvSize;
                            self.next_state = DfaState::RecvFormName;
                        }
                        Ok(RequestCode::Attachment) => {
                            self.state = DfaState::RecvSize;
                            self.next_state = DfaState::RecvAttachmentName;
                        }
                        Ok(RequestCode::Submit) => {
                            if self.url.is_none() {
                                // no URL was set, fail instantly
                                warn!(
                                    "[{}:{}] client submitted with no URL set",
                                    self.client_number, self.job_number
                                );
                                self.state = DfaState::SendInit;
                            } else {
                                info!(
                                    "[{}:{}] job ready",
                                    self.client_number, self.job_number
                                );
                                self.request_time = Some(Instant::now());
                                self.state = DfaState::Waiting;
                                return Drive::Submit;
                            }
                        }
                        Err(e) => return Drive::Dead(e),
                    }
                }

                DfaState::RecvSize => {
                    // a 32-bit little-endian length for the next field
                    match self.fill_recv(4) {
                        Ok(Io::Ready(buf)) => {
                            self.pending_size = LittleEndian::read_u32(&buf) as usize;
                            self.state = self.next_state;
                        }
                        Ok(Io::Blocked) => return Drive::Blocked,
                        Ok(Io::Disconnected) => return Drive::Hangup,
                        Err(e) => return Drive::Dead(e),
                    }
                }

                DfaState::RecvUrl
                | DfaState::RecvHeader
                | DfaState::RecvFormName
                | DfaState::RecvFormData
                | DfaState::RecvAttachmentName
                | DfaState::RecvAttachmentFile
                | DfaState::RecvAttachmentFilename => {
                    let data = match self.fill_recv(self.pending_size) {
                        Ok(Io::Ready(buf)) => buf,
                        Ok(Io::Blocked) => return Drive::Blocked,
                        Ok(Io::Disconnected) => return Drive::Hangup,
                        Err(e) => return Drive::Dead(e),
                    };
                    if let Err(e) = self.consume_field(data) {
                        return Drive::Dead(e);
                    }
                }

                DfaState::RecvAttachmentComplete => {
                    // the trailing size field is the mapping size, no
                    // further payload follows
                    self.complete_attachment();
                    self.state = DfaState::RecvInit;
                }

                DfaState::Waiting | DfaState::InProgress => {
                    // parked on the upstream pool; the event loop
                    // moves us on when the transfer completes
                    return Drive::Blocked;
                }

                DfaState::SendInit => {
                    if !self.send_active {
                        // build the next response frame header
                        let reply = self.next_reply();
                        self.begin_frame(&reply);
                        self.dr = Some(reply);
                    }
                    match self.pump_send() {
                        Ok(Io::Ready(())) => {
                            debug!(
                                "[{}:{}] sent '{}' to client",
                                self.client_number,
                                self.job_number,
                                self.dr.as_ref().map(|r| r.code() as u8 as char).unwrap_or('?'),
                            );
                            self.state = self.next_state;
                        }
                        Ok(Io::Blocked) => return Drive::Blocked,
                        Ok(Io::Disconnected) => return Drive::Hangup,
                        Err(e) => return Drive::Dead(e),
                    }
                }

                DfaState::SendDataHeader => match self.pump_reply_bytes(|dr| match dr {
                    Reply::Body { headers, .. } => Some(headers.clone()),
                    _ => None,
                }) {
                    Ok(Io::Ready(())) => self.state = DfaState::SendDataBody,
                    Ok(Io::Blocked) => return Drive::Blocked,
                    Ok(Io::Disconnected) => return Drive::Hangup,
                    Err(e) => return Drive::Dead(e),
                },

                DfaState::SendDataBody => match self.pump_reply_bytes(|dr| match dr {
                    Reply::Body { data, .. } => Some(data.clone()),
                    _ => None,
                }) {
                    Ok(Io::Ready(())) => self.state = DfaState::SendDrDone,
                    Ok(Io::Blocked) => return Drive::Blocked,
                    Ok(Io::Disconnected) => return Drive::Hangup,
                    Err(e) => return Drive::Dead(e),
                },

                DfaState::SendAttachmentHeader => match self.pump_reply_bytes(|dr| match dr {
                    Reply::Attachment { headers, .. } => Some(headers.clone()),
                    _ => None,
                }) {
                    Ok(Io::Ready(())) => self.state = DfaState::SendAttachmentFilename,
                    Ok(Io::Blocked) => return Drive::Blocked,
                    Ok(Io::Disconnected) => return Drive::Hangup,
                    Err(e) => return Drive::Dead(e),
                },

                DfaState::SendAttachmentFilename => match self.pump_reply_bytes(|dr| match dr {
                    Reply::Attachment { filename, .. } => Some(filename.clone().into_bytes()),
                    _ => None,
                }) {
                    Ok(Io::Ready(())) => self.state = DfaState::SendAttachmentTmpfilename,
                    Ok(Io::Blocked) => return Drive::Blocked,
                    Ok(Io::Disconnected) => return Drive::Hangup,
                    Err(e) => return Drive::Dead(e),
                },

                DfaState::SendAttachmentTmpfilename => match self.pump_reply_bytes(|dr| match dr {
                    Reply::Attachment { tmp_path, .. } => {
                        Some(tmp_path.to_string_lossy().into_owned().into_bytes())
                    }
                    _ => None,
                }) {
                    Ok(Io::Ready(())) => self.state = DfaState::SendDrDone,
                    Ok(Io::Blocked) => return Drive::Blocked,
                    Ok(Io::Disconnected) => return Drive::Hangup,
                    Err(e) => return Drive::Dead(e),
                },

                DfaState::SendDrDone => {
                    self.dr = None;
                    self.state = DfaState::SendInit;
                }

                DfaState::Reset => {
                    info!("[{}:{}] job complete", self.client_number, self.job_number);

                    let was_post = self.is_post();
                    let elapsed = self.request_time.take().map(|t| t.elapsed());

                    // clear the old request state but keep the socket
                    // (and the accumulated headers) so the client can
                    // issue another request on the same session
                    self.url = None;
                    self.fields.clear();
                    self.attachments.clear();
                    self.response = None;
                    self.response_begun = false;
                    self.part_cursor = 0;
                    self.dr = None;
                    self.job_number += 1;
                    self.state = DfaState::RecvInit;

                    return Drive::Finished { was_post, elapsed };
                }
            }
        }
    }

    /// Dispatch one completed length-prefixed field according to the
    /// state that was reading it.
    fn consume_field(&mut self, data: Vec<u8>) -> anyhow::Result<()> {
        match self.state {
            DfaState::RecvUrl => {
                self.discard_response();
                self.url = Some(
                    String::from_utf8(data).map_err(|_| anyhow!("request URL is not utf-8"))?,
                );
                self.state = DfaState::RecvInit;
            }
            DfaState::RecvHeader => {
                self.discard_response();
                let header = String::from_utf8(data)
                    .map_err(|_| anyhow!("request header is not utf-8"))?;
                debug!("[{}:{}] new header: {}", self.client_number, self.job_number, header);
                self.headers.push(header);
                self.state = DfaState::RecvInit;
            }
            DfaState::RecvFormName => {
                self.stashed[0] = Some(data);
                self.state = DfaState::RecvSize;
                self.next_state = DfaState::RecvFormData;
            }
            DfaState::RecvFormData => {
                self.discard_response();
                let name = self.take_stashed_string(0)?;
                self.fields.push((name, data));
                self.state = DfaState::RecvInit;
            }
            DfaState::RecvAttachmentName => {
                self.stashed[0] = Some(data);
                self.state = DfaState::RecvSize;
                self.next_state = DfaState::RecvAttachmentFile;
            }
            DfaState::RecvAttachmentFile => {
                self.stashed[1] = Some(data);
                self.state = DfaState::RecvSize;
                self.next_state = DfaState::RecvAttachmentFilename;
            }
            DfaState::RecvAttachmentFilename => {
                self.stashed[2] = Some(data);
                self.state = DfaState::RecvSize;
                self.next_state = DfaState::RecvAttachmentComplete;
            }
            state => return Err(anyhow!("broken state machine: {:?}", state)),
        }
        Ok(())
    }

    /// All four attachment fields are in: map the shared artifact and
    /// add it to the form. A mapping failure skips the attachment but
    /// keeps the session alive.
    fn complete_attachment(&mut self) {
        self.discard_response();
        let map_size = self.pending_size;
        let parts = (
            self.take_stashed_string(0),
            self.take_stashed_string(1),
            self.take_stashed_string(2),
        );
        let (name, share_name, filename) = match parts {
            (Ok(n), Ok(s), Ok(f)) => (n, s, f),
            _ => {
                warn!(
                    "[{}:{}] attachment fields were not utf-8, dropping attachment",
                    self.client_number, self.job_number
                );
                return;
            }
        };

        match SharedMapping::open(&share_name, map_size) {
            Ok(mapping) => {
                debug!(
                    "[{}:{}] added attachment: [{}] {}",
                    self.client_number, self.job_number, name, filename
                );
                self.attachments.push(FormAttachment {
                    field_name: name,
                    filename,
                    mapping: Arc::new(mapping),
                });
            }
            Err(e) => {
                warn!(
                    "[{}:{}] could not map shared artifact '{}': {:?}",
                    self.client_number, self.job_number, share_name, e
                );
            }
        }
    }

    fn take_stashed_string(&mut self, slot: usize) -> anyhow::Result<String> {
        let bytes =
            self.stashed[slot].take().ok_or_else(|| anyhow!("missing stashed string"))?;
        String::from_utf8(bytes).map_err(|_| anyhow!("stashed string is not utf-8"))
    }

    /// Mutating the request discards any response still cached on the
    /// session. Undelivered attachment temp files go with it.
    fn discard_response(&mut self) {
        if self.response.is_some() {
            self.response = None;
            self.response_begun = false;
            self.part_cursor = 0;
        }
    }

    /// Produce the next response frame for the client: the HTTP code
    /// first, then each part in server order, then the terminal. Once
    /// the terminal is produced the stored response is released.
    fn next_reply(&mut self) -> Reply {
        let Some(response) = self.response.as_mut() else {
            // no response at all: the request could not be performed
            return Reply::Failed;
        };

        if !self.response_begun {
            // there's no point in returning half a message, so fail
            // early
            if !response.complete {
                self.response = None;
                return Reply::Incomplete;
            }
            self.response_begun = true;
            self.part_cursor = 0;
            return Reply::HttpStatus(response.code);
        }

        while self.part_cursor < response.parts.len() {
            let part = &mut response.parts[self.part_cursor];
            self.part_cursor += 1;
            if part.is_attachment() {
                if let (Some(filename), Some(tmp_path)) =
                    (part.filename.clone(), part.tmp_path())
                {
                    return Reply::Attachment {
                        headers: part.headers.clone(),
                        filename,
                        tmp_path,
                    };
                }
            } else if let Some(data) = &part.data {
                return Reply::Body { headers: part.headers.clone(), data: data.clone() };
            }
        }

        // every part has been surfaced; the attachment temp files now
        // belong to the client
        if let Some(mut response) = self.response.take() {
            response.mark_delivered();
        }
        self.response_begun = false;
        Reply::Complete
    }

    /// Format the fixed-size frame header for a reply into the send
    /// buffer and pick the state that streams its payload.
    fn begin_frame(&mut self, reply: &Reply) {
        let mut frame = vec![reply.code() as u8];
        match reply {
            Reply::Failed | Reply::Incomplete | Reply::Complete => {
                self.next_state = DfaState::Reset;
            }
            Reply::HttpStatus(code) => {
                frame.extend_from_slice(&code.to_le_bytes());
                self.next_state = DfaState::SendInit;
            }
            Reply::Body { headers, data } => {
                frame.extend_from_slice(&(headers.len() as u32).to_le_bytes());
                frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
                self.next_state = DfaState::SendDataHeader;
            }
            Reply::Attachment { headers, filename, tmp_path } => {
                let tmp = tmp_path.to_string_lossy();
                frame.extend_from_slice(&(headers.len() as u32).to_le_bytes());
                frame.extend_from_slice(&(filename.len() as u32).to_le_bytes());
                frame.extend_from_slice(&(tmp.len() as u32).to_le_bytes());
                self.next_state = DfaState::SendAttachmentHeader;
            }
        }
        self.begin_send(frame);
    }

    /// Start streaming one payload of the current reply, extracted by
    /// `pick`; subsequent calls resume the partial send.
    fn pump_reply_bytes<F>(&mut self, pick: F) -> anyhow::Result<Io<()>>
    where
        F: FnOnce(&Reply) -> Option<Vec<u8>>,
    {
        if !self.send_active {
            let bytes = self
                .dr
                .as_ref()
                .and_then(pick)
                .ok_or_else(|| anyhow!("send state does not match pending reply"))?;
            self.begin_send(bytes);
        }
        self.pump_send()
    }

    fn begin_send(&mut self, bytes: Vec<u8>) {
        self.send_buf = bytes;
        self.send_off = 0;
        self.send_active = true;
    }

    /// Push the send buffer out, resumably.
    fn pump_send(&mut self) -> anyhow::Result<Io<()>> {
        while self.send_off < self.send_buf.len() {
            match self.stream.write(&self.send_buf[self.send_off..]) {
                Ok(0) => return Ok(Io::Disconnected),
                Ok(n) => self.send_off += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(Io::Blocked),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    return Ok(Io::Disconnected)
                }
                Err(e) => return Err(e).context("writing client socket"),
            }
        }
        self.send_buf = vec![];
        self.send_off = 0;
        self.send_active = false;
        Ok(Io::Ready(()))
    }

    /// Read a known amount of data, resumably. `Io::Ready` hands the
    /// filled buffer over and clears the scratch state.
    fn fill_recv(&mut self, want: usize) -> anyhow::Result<Io<Vec<u8>>> {
        if !self.recv_active {
            self.recv_buf = vec![0; want];
            self.recv_filled = 0;
            self.recv_active = true;
        }
        while self.recv_filled < self.recv_buf.len() {
            match self.stream.read(&mut self.recv_buf[self.recv_filled..]) {
                // the client went away
                Ok(0) => return Ok(Io::Disconnected),
                Ok(n) => self.recv_filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(Io::Blocked),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                    return Ok(Io::Disconnected)
                }
                Err(e) => return Err(e).context("reading client socket"),
            }
        }
        self.recv_active = false;
        Ok(Io::Ready(std::mem::take(&mut self.recv_buf)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::share::{fresh_share_name, StashedFile};
    use ccpool_protocol as protocol;
    use std::io::Write as _;

    fn pair() -> (UnixStream, Session) {
        let (client, server) = UnixStream::pair().expect("socketpair to succeed");
        let session = Session::new(server, 0).expect("session to build");
        (client, session)
    }

    fn drive_blocked(session: &mut Session) {
        match session.drive() {
            Drive::Blocked => {}
            _ => panic!("expected the session to block"),
        }
    }

    #[test]
    fn request_frames_arrive_in_order() {
        let (mut client, mut session) = pair();

        protocol::write_set_url(&mut client, "https://cache/v1.0/cache/abcd-xyz")
            .expect("write to succeed");
        protocol::write_add_header(&mut client, "X-USER-KEY: k").expect("write to succeed");
        protocol::write_add_header(&mut client, "X-CLIENT-SESSION-ID: 7")
            .expect("write to succeed");
        protocol::write_form_field(&mut client, "data", b"{\"x\":1}").expect("write to succeed");
        drive_blocked(&mut session);

        assert_eq!(session.url.as_deref(), Some("https://cache/v1.0/cache/abcd-xyz"));
        assert_eq!(session.headers, vec!["X-USER-KEY: k", "X-CLIENT-SESSION-ID: 7"]);
        assert_eq!(session.fields, vec![(String::from("data"), b"{\"x\":1}".to_vec())]);

        protocol::write_submit(&mut client).expect("write to succeed");
        match session.drive() {
            Drive::Submit => {}
            _ => panic!("expected a submit"),
        }
        assert!(session.is_waiting());
        assert!(session.is_post());
    }

    #[test]
    fn attachment_maps_shared_artifact() {
        let (mut client, mut session) = pair();

        let share = fresh_share_name();
        let payload = b"\x7fELF fake object";
        let stashed = StashedFile::create(&share, payload).expect("stash to succeed");

        protocol::write_attachment(&mut client, "object", &share, "obj.o", stashed.map_size())
            .expect("write to succeed");
        drive_blocked(&mut session);

        assert_eq!(session.attachments.len(), 1);
        assert_eq!(session.attachments[0].field_name, "object");
        assert_eq!(session.attachments[0].filename, "obj.o");
        assert_eq!(session.attachments[0].mapping.payload(), payload);
        assert!(session.is_post());
    }

    #[test]
    fn submit_without_url_fails_immediately() {
        let (mut client, mut session) = pair();

        protocol::write_submit(&mut client).expect("write to succeed");
        match session.drive() {
            Drive::Finished { was_post: false, .. } => {}
            _ => panic!("expected the failed request to finish"),
        }

        let reply = Reply::read_from(&mut client).expect("reply to parse");
        assert_eq!(reply, Reply::Failed);

        // the session is reusable afterwards
        protocol::write_set_url(&mut client, "https://h/x").expect("write to succeed");
        protocol::write_submit(&mut client).expect("write to succeed");
        match session.drive() {
            Drive::Submit => {}
            _ => panic!("expected a submit"),
        }
        assert_eq!(session.job_number, 1);
    }

    #[test]
    fn response_streams_as_frames() {
        let (mut client, mut session) = pair();

        protocol::write_set_url(&mut client, "https://h/x").expect("write to succeed");
        protocol::write_submit(&mut client).expect("write to succeed");
        match session.drive() {
            Drive::Submit => {}
            _ => panic!("expected a submit"),
        }
        session.mark_in_progress();

        let mut response = ServerResponse::new(std::env::temp_dir());
        response.begin(200, Some("application/json"), Some(17));
        response.push(b"{\"exit_status\":0}").expect("push to succeed");
        response.finish().expect("finish to succeed");
        assert!(response.complete);
        session.attach_response(Some(response));

        match session.drive() {
            Drive::Finished { was_post: false, elapsed } => {
                assert!(elapsed.is_some());
            }
            _ => panic!("expected the response to finish"),
        }

        assert_eq!(Reply::read_from(&mut client).expect("parse"), Reply::HttpStatus(200));
        assert_eq!(
            Reply::read_from(&mut client).expect("parse"),
            Reply::Body { headers: vec![], data: b"{\"exit_status\":0}".to_vec() },
        );
        assert_eq!(Reply::read_from(&mut client).expect("parse"), Reply::Complete);

        // ready for the next request on the same socket
        assert_eq!(session.state(), DfaState::RecvInit);
        assert_eq!(session.job_number, 1);
        assert!(session.url.is_none());
    }

    #[test]
    fn failed_transfer_reports_failed_terminal() {
        let (mut client, mut session) = pair();

        protocol::write_set_url(&mut client, "https://h/x").expect("write to succeed");
        protocol::write_submit(&mut client).expect("write to succeed");
        match session.drive() {
            Drive::Submit => {}
            _ => panic!("expected a submit"),
        }
        session.mark_in_progress();
        session.attach_response(None);

        match session.drive() {
            Drive::Finished { .. } => {}
            _ => panic!("expected the failure to finish"),
        }
        assert_eq!(Reply::read_from(&mut client).expect("parse"), Reply::Failed);
    }

    #[test]
    fn incomplete_response_reports_incomplete_terminal() {
        let (mut client, mut session) = pair();

        protocol::write_set_url(&mut client, "https://h/x").expect("write to succeed");
        protocol::write_submit(&mut client).expect("write to succeed");
        match session.drive() {
            Drive::Submit => {}
            _ => panic!("expected a submit"),
        }
        session.mark_in_progress();

        let mut response = ServerResponse::new(std::env::temp_dir());
        response.begin(200, Some("application/json"), Some(100));
        response.push(b"{\"trunc").expect("push to succeed");
        response.finish().expect("finish to succeed");
        assert!(!response.complete);
        session.attach_response(Some(response));

        match session.drive() {
            Drive::Finished { .. } => {}
            _ => panic!("expected the incomplete response to finish"),
        }
        assert_eq!(Reply::read_from(&mut client).expect("parse"), Reply::Incomplete);
    }

    #[test]
    fn unknown_opcode_kills_session() {
        let (mut client, mut session) = pair();
        client.write_all(b"Q").expect("write to succeed");
        match session.drive() {
            Drive::Dead(_) => {}
            _ => panic!("expected the session to die"),
        }
    }

    #[test]
    fn client_disconnect_is_a_hangup() {
        let (client, mut session) = pair();
        drop(client);
        match session.drive() {
            Drive::Hangup => {}
            _ => panic!("expected a hangup"),
        }
    }

    #[test]
    fn headers_survive_reset() {
        let (mut client, mut session) = pair();

        protocol::write_add_header(&mut client, "X-USER-KEY: k").expect("write to succeed");
        protocol::write_submit(&mut client).expect("write to succeed");
        match session.drive() {
            // no URL: fails, resets
            Drive::Finished { .. } => {}
            _ => panic!("expected a finish"),
        }
        assert_eq!(Reply::read_from(&mut client).expect("parse"), Reply::Failed);

        // auth headers are installed once per connection and persist
        // across jobs
        assert_eq!(session.headers, vec!["X-USER-KEY: k"]);
        assert!(session.url.is_none());
    }
}
