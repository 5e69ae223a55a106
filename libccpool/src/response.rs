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

//! The server response model and the byte-stream reassembler that
//! builds it. Both plain and `multipart/mixed` responses flow through
//! the same reassembler, which accepts arbitrarily sized chunks and
//! must not miss a part boundary that straddles two of them.

use std::{
    fs::File,
    io::Write as _,
    path::{Path, PathBuf},
};

use anyhow::Context;
use ccpool_protocol::Reply;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// One part of a server response. Parts carrying a
/// `Content-Disposition: attachment` header are streamed to a temp
/// file and never held in memory; everything else accumulates in the
/// data buffer.
#[derive(Debug, Default)]
pub struct ResponsePart {
    /// The raw part header block, line by line, CRLF terminators
    /// included. Empty for the part before the first boundary and for
    /// single-part messages.
    pub headers: Vec<u8>,
    pub mime_type: Option<String>,
    /// In-memory payload. `None` until any payload byte (or an empty
    /// header block) has been seen, which is how a content-free
    /// preamble part knows to stay silent.
    pub data: Option<Vec<u8>>,
    /// The server-supplied attachment file name. Presence marks this
    /// part as an attachment.
    pub filename: Option<String>,
    headers_complete: bool,
    tmpfile: Option<NamedTempFile>,
    kept_path: Option<PathBuf>,
}

impl ResponsePart {
    fn preamble() -> ResponsePart {
        // single-part messages and the part before the first boundary
        // have no part headers
        ResponsePart { headers_complete: true, ..Default::default() }
    }

    fn subsequent() -> ResponsePart {
        ResponsePart::default()
    }

    pub fn is_attachment(&self) -> bool {
        self.filename.is_some()
    }

    /// The path the part's bytes were streamed to, if any.
    pub fn tmp_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.kept_path {
            Some(path.clone())
        } else {
            self.tmpfile.as_ref().map(|t| t.path().to_path_buf())
        }
    }

    /// Hand ownership of the temp file over to whoever holds the
    /// path. Without this the file is removed when the part drops,
    /// which is what we want for responses that never reached their
    /// client.
    pub fn persist(&mut self) {
        if let Some(tmpfile) = self.tmpfile.take() {
            match tmpfile.keep() {
                Ok((_file, path)) => self.kept_path = Some(path),
                Err(e) => warn!("persisting attachment temp file: {}", e),
            }
        }
    }
}

/// A server response as reassembled from the wire.
#[derive(Debug)]
pub struct ServerResponse {
    /// HTTP status code from the response line.
    pub code: u16,
    /// True once a terminating boundary (multipart) or the declared
    /// content length (single-part) has been observed. A response
    /// that never completes is reported to the client as incomplete.
    pub complete: bool,
    pub mime_type: Option<String>,
    declared_len: u64,
    /// The boundary marker including the leading `\r\n--`, so a plain
    /// search never matches boundary text embedded in part payloads.
    boundary: Option<Vec<u8>>,
    pub parts: Vec<ResponsePart>,
    stash: Vec<u8>,
    temp_dir: PathBuf,
}

impl ServerResponse {
    pub fn new<P: AsRef<Path>>(temp_dir: P) -> ServerResponse {
        ServerResponse {
            code: 0,
            complete: false,
            mime_type: None,
            declared_len: 0,
            boundary: None,
            parts: vec![],
            stash: vec![],
            temp_dir: temp_dir.as_ref().to_path_buf(),
        }
    }

    /// Record what the response headers told us: the status code, the
    /// content type (capturing the boundary for `multipart/mixed`),
    /// and the declared body length.
    pub fn begin(&mut self, code: u16, content_type: Option<&str>, content_length: Option<u64>) {
        self.code = code;
        if let Some(value) = content_type {
            let (mime, boundary) = parse_content_type(value);
            self.mime_type = Some(mime);
            self.boundary = boundary;
        }
        self.declared_len = content_length.unwrap_or(0);
    }

    /// Feed one chunk of body bytes.
    pub fn push(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        self.ingest(Some(chunk))
    }

    /// Flush: no more bytes are coming. Forces any stashed tail
    /// through and settles completeness for single-part messages.
    pub fn finish(&mut self) -> anyhow::Result<()> {
        self.ingest(None)?;
        if !self.complete && self.boundary.is_none() {
            let body_len = self
                .parts
                .first()
                .and_then(|p| p.data.as_ref())
                .map(|d| d.len() as u64)
                .unwrap_or(0);
            if body_len == self.declared_len {
                self.complete = true;
            }
        }
        Ok(())
    }

    fn ingest(&mut self, chunk: Option<&[u8]>) -> anyhow::Result<()> {
        // once the end of the message has been seen, anything more is
        // junk
        if self.complete {
            return Ok(());
        }

        let is_final = chunk.is_none();

        // prepend the stash so a boundary chopped in half by the
        // previous chunk is still found whole
        let mut data = std::mem::take(&mut self.stash);
        if let Some(chunk) = chunk {
            data.extend_from_slice(chunk);
        }
        if data.is_empty() {
            return Ok(());
        }

        if self.parts.is_empty() {
            // even non-multipart messages have one part
            self.parts.push(ResponsePart::preamble());
        }

        let boundary_len = self.boundary.as_ref().map(|b| b.len()).unwrap_or(0);
        let mut pos = 0;
        let mut stalled = false;

        while !stalled
            && !self.complete
            && (data.len() - pos > boundary_len || (is_final && data.len() > pos))
        {
            // find how much of the data belongs to the current part
            let (end, boundary_hit) = match &self.boundary {
                Some(boundary) => match find(&data[pos..], boundary) {
                    Some(off) => (pos + off, true),
                    // hold back one boundary's worth so a marker split
                    // across chunks is not consumed as payload
                    None if is_final => (data.len(), false),
                    None => (data.len() - boundary_len, false),
                },
                None => (data.len(), false),
            };

            // read the part headers, if we haven't already
            {
                let part = self.parts.last_mut().context("no current part")?;
                if !part.headers_complete {
                    loop {
                        match find(&data[pos..end], b"\r\n") {
                            Some(0) => {
                                pos += 2;
                                part.headers_complete = true;
                                break;
                            }
                            Some(off) => {
                                part.headers.extend_from_slice(&data[pos..pos + off + 2]);
                                pos += off + 2;
                            }
                            None => {
                                // incomplete headers, wait for more data
                                stalled = true;
                                break;
                            }
                        }
                    }
                    if stalled {
                        break;
                    }
                    if part.headers.is_empty() {
                        // zero-length headers are legal, the part is a
                        // plain data part
                        part.data = Some(vec![]);
                    } else {
                        let (mime, filename) = parse_part_headers(&part.headers);
                        part.mime_type = mime;
                        debug!("new part, type {:?} filename {:?}", part.mime_type, filename);
                        if let Some(filename) = filename {
                            // attachments go straight to file
                            let basename = match filename.rsplit('/').next() {
                                Some(b) if !b.is_empty() => b,
                                _ => filename.as_str(),
                            };
                            let tmpfile = tempfile::Builder::new()
                                .prefix(&format!("download.{basename}."))
                                .tempfile_in(&self.temp_dir)
                                .context("opening attachment temp file")?;
                            part.tmpfile = Some(tmpfile);
                            part.filename = Some(filename);
                        }
                    }
                }

                // append the payload bytes up to the boundary (or the
                // end of what we dare consume)
                if pos != end {
                    if let Some(tmpfile) = part.tmpfile.as_mut() {
                        tmpfile
                            .as_file_mut()
                            .write_all(&data[pos..end])
                            .context("writing attachment temp file")?;
                    } else {
                        part.data.get_or_insert_with(Vec::new).extend_from_slice(&data[pos..end]);
                    }
                    pos = end;
                }
            }

            if boundary_hit {
                // the rest of the boundary line is ignored; if we
                // don't have all of it yet, stash and read more
                let after = pos + boundary_len;
                let next_line = match find(&data[after..], b"\r\n") {
                    Some(off) => after + off + 2,
                    None if is_final => data.len(),
                    None => {
                        stalled = true;
                        break;
                    }
                };

                if data[after..].starts_with(b"--") {
                    // a final boundary line: there are no more parts,
                    // any more data is junk
                    self.complete = true;
                } else {
                    self.parts.push(ResponsePart::subsequent());
                    pos = next_line;
                }
            }
        }

        if pos < data.len() && !self.complete {
            // stash the remainder so the next chunk can resume where
            // this one left off
            self.stash = data[pos..].to_vec();
        }

        // multipart responses complete on the final boundary, checked
        // above; single-part responses complete at the right length
        if self.boundary.is_none() {
            if let Some(part) = self.parts.last() {
                let len = part.data.as_ref().map(|d| d.len() as u64).unwrap_or(0);
                if len == self.declared_len {
                    self.complete = true;
                }
            }
        }

        Ok(())
    }

    /// Persist every attachment temp file: the response reached its
    /// client, so the files now belong to whoever holds the paths.
    pub fn mark_delivered(&mut self) {
        for part in self.parts.iter_mut() {
            part.persist();
        }
    }

    /// Flatten the response into the reply frame sequence a client
    /// observes: status, then parts in server order, then a terminal.
    /// Used by the no-daemon mode; the daemon streams frames through
    /// its send state machine instead.
    pub fn into_replies(mut self) -> Vec<Reply> {
        if !self.complete {
            return vec![Reply::Incomplete];
        }

        let mut replies = vec![Reply::HttpStatus(self.code)];
        for part in self.parts.iter_mut() {
            if part.is_attachment() {
                part.persist();
                if let (Some(filename), Some(tmp_path)) = (part.filename.clone(), part.tmp_path())
                {
                    replies.push(Reply::Attachment {
                        headers: std::mem::take(&mut part.headers),
                        filename,
                        tmp_path,
                    });
                }
            } else if let Some(data) = part.data.take() {
                replies.push(Reply::Body { headers: std::mem::take(&mut part.headers), data });
            }
        }
        replies.push(Reply::Complete);
        replies
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Split a Content-Type value into the MIME type and, for
/// `multipart/mixed`, the boundary marker prefixed with `\r\n--`.
fn parse_content_type(value: &str) -> (String, Option<Vec<u8>>) {
    let (mime, params) = match value.split_once(';') {
        Some((mime, params)) => (mime.trim(), Some(params)),
        None => (value.trim(), None),
    };

    let mut boundary = None;
    if mime.eq_ignore_ascii_case("multipart/mixed") {
        if let Some(params) = params {
            for param in params.split(';') {
                if let Some(b) = param.trim().strip_prefix("boundary=") {
                    let b = b.trim().trim_matches('"');
                    let mut marker = b"\r\n--".to_vec();
                    marker.extend_from_slice(b.as_bytes());
                    boundary = Some(marker);
                }
            }
        }
    }

    (String::from(mime), boundary)
}

/// Pull the Content-Type and attachment filename out of a raw part
/// header block.
fn parse_part_headers(block: &[u8]) -> (Option<String>, Option<String>) {
    let text = String::from_utf8_lossy(block);
    let mut mime_type = None;
    let mut filename = None;

    for line in text.split("\r\n") {
        if let Some(rest) = line.strip_prefix("Content-Type: ") {
            mime_type = Some(String::from(rest.trim_end()));
        } else if let Some(rest) = line.strip_prefix("Content-Disposition: ") {
            if let Some(name) = rest.strip_prefix("attachment; filename=") {
                let end = name.find(';').unwrap_or(name.len());
                filename = Some(String::from(name[..end].trim().trim_matches('"')));
            }
        }
    }

    (mime_type, filename)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    const MULTIPART_BODY: &[u8] = b"\r\n--b\r\n\
Content-Type: application/json\r\n\
?file=data\r\n\
\r\n\
{\"exit_status\":0}\r\n--b\r\n\
Content-Disposition: attachment; filename=object\r\n\
?file=object\r\n\
\r\n\
\x7fELF\x01\x02\x03\r\n--b--\r\n";

    fn multipart_response() -> ServerResponse {
        let mut response = ServerResponse::new(std::env::temp_dir());
        response.begin(200, Some("multipart/mixed; boundary=\"b\""), None);
        response
    }

    fn summarize(response: &ServerResponse) -> Vec<(Vec<u8>, Option<String>, Vec<u8>)> {
        response
            .parts
            .iter()
            .filter(|p| p.is_attachment() || p.data.is_some())
            .map(|p| {
                let payload = if let Some(path) = p.tmp_path() {
                    fs::read(path).expect("attachment file to be readable")
                } else {
                    p.data.clone().unwrap_or_default()
                };
                (p.headers.clone(), p.filename.clone(), payload)
            })
            .collect()
    }

    fn cleanup(response: ServerResponse) {
        for part in response.parts.iter() {
            if let Some(path) = &part.kept_path {
                let _ = fs::remove_file(path);
            }
        }
    }

    #[test]
    fn multipart_single_chunk() {
        let mut response = multipart_response();
        response.push(MULTIPART_BODY).expect("push to succeed");
        response.finish().expect("finish to succeed");

        assert!(response.complete);
        let parts = summarize(&response);
        assert_eq!(parts.len(), 2);

        let (headers, filename, data) = &parts[0];
        assert!(headers.starts_with(b"Content-Type: application/json\r\n"));
        assert_eq!(*filename, None);
        assert_eq!(data, b"{\"exit_status\":0}");

        let (headers, filename, data) = &parts[1];
        assert!(find(headers, b"?file=object").is_some());
        assert_eq!(filename.as_deref(), Some("object"));
        assert_eq!(data, b"\x7fELF\x01\x02\x03");

        cleanup(response);
    }

    #[test]
    fn multipart_every_split_point() {
        let mut single = multipart_response();
        single.push(MULTIPART_BODY).expect("push to succeed");
        single.finish().expect("finish to succeed");
        let want = summarize(&single);

        for split in 1..MULTIPART_BODY.len() {
            let mut response = multipart_response();
            response.push(&MULTIPART_BODY[..split]).expect("push to succeed");
            response.push(&MULTIPART_BODY[split..]).expect("push to succeed");
            response.finish().expect("finish to succeed");

            assert!(response.complete, "split at {} left response incomplete", split);
            assert_eq!(summarize(&response), want, "split at {} changed the parts", split);
            cleanup(response);
        }

        cleanup(single);
    }

    #[test]
    fn multipart_byte_at_a_time() {
        let mut single = multipart_response();
        single.push(MULTIPART_BODY).expect("push to succeed");
        single.finish().expect("finish to succeed");
        let want = summarize(&single);

        let mut response = multipart_response();
        for byte in MULTIPART_BODY {
            response.push(std::slice::from_ref(byte)).expect("push to succeed");
        }
        response.finish().expect("finish to succeed");

        assert!(response.complete);
        assert_eq!(summarize(&response), want);

        cleanup(response);
        cleanup(single);
    }

    #[test]
    fn multipart_missing_terminator_is_incomplete() {
        let truncated = &MULTIPART_BODY[..MULTIPART_BODY.len() - 9];
        let mut response = multipart_response();
        response.push(truncated).expect("push to succeed");
        response.finish().expect("finish to succeed");

        assert!(!response.complete);
        assert_eq!(response.into_replies(), vec![Reply::Incomplete]);
    }

    #[test]
    fn single_part_completes_at_declared_length() {
        let body = b"{\"result\":\"success\"}";
        let mut response = ServerResponse::new(std::env::temp_dir());
        response.begin(200, Some("application/json"), Some(body.len() as u64));
        response.push(&body[..7]).expect("push to succeed");
        assert!(!response.complete);
        response.push(&body[7..]).expect("push to succeed");
        response.finish().expect("finish to succeed");

        assert!(response.complete);
        let replies = response.into_replies();
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0], Reply::HttpStatus(200));
        assert_eq!(replies[1], Reply::Body { headers: vec![], data: body.to_vec() });
        assert_eq!(replies[2], Reply::Complete);
    }

    #[test]
    fn single_part_short_body_is_incomplete() {
        let mut response = ServerResponse::new(std::env::temp_dir());
        response.begin(200, Some("application/json"), Some(100));
        response.push(b"{\"trunc").expect("push to succeed");
        response.finish().expect("finish to succeed");

        assert!(!response.complete);
    }

    #[test]
    fn empty_body_with_zero_length_completes() {
        let mut response = ServerResponse::new(std::env::temp_dir());
        response.begin(204, None, Some(0));
        response.finish().expect("finish to succeed");
        assert!(response.complete);
    }

    #[test]
    fn undelivered_attachment_temp_file_is_removed() {
        let mut response = multipart_response();
        response.push(MULTIPART_BODY).expect("push to succeed");
        response.finish().expect("finish to succeed");

        let tmp = response
            .parts
            .iter()
            .find(|p| p.is_attachment())
            .and_then(|p| p.tmp_path())
            .expect("attachment to have a temp path");
        assert!(tmp.exists());

        drop(response);
        assert!(!tmp.exists());
    }

    #[test]
    fn content_type_parsing() {
        let (mime, boundary) = parse_content_type("multipart/mixed; boundary=\"xyz\"");
        assert_eq!(mime, "multipart/mixed");
        assert_eq!(boundary, Some(b"\r\n--xyz".to_vec()));

        let (mime, boundary) = parse_content_type("multipart/mixed; boundary=xyz");
        assert_eq!(mime, "multipart/mixed");
        assert_eq!(boundary, Some(b"\r\n--xyz".to_vec()));

        let (mime, boundary) = parse_content_type("application/json");
        assert_eq!(mime, "application/json");
        assert_eq!(boundary, None);
    }
}
