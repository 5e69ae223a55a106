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

//! The framed, length-prefixed protocol spoken over the daemon's
//! Unix-domain socket. Every frame starts with a single ASCII opcode
//! byte; all multi-byte integers are little-endian; strings carry no
//! terminator, their length prefix is authoritative.

use std::{
    io::{self, Read, Write},
    path::PathBuf,
};

use anyhow::anyhow;
use byteorder::{LittleEndian, ReadBytesExt as _, WriteBytesExt as _};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The revision of the local wire protocol. This number is baked into
/// the socket file name so that clients and daemons with incompatible
/// framing coexist in the same cache directory rather than confusing
/// one another.
pub const LOCAL_PROTOCOL_REVISION: u32 = 1;

/// The name of the daemon socket file within the cache directory.
/// There is one daemon per (cache dir, user, host, protocol revision).
pub fn socket_file_name(euid: u32, hostname: &str) -> String {
    format!("daemon.{}.{}.{}", euid, hostname, LOCAL_PROTOCOL_REVISION)
}

/// RequestCode tags the frames a client sends while building up and
/// finally submitting a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestCode {
    /// One length-prefixed string: the request URL.
    SetUrl = b'U' as isize,
    /// One length-prefixed string: a raw header line.
    AddHeader = b'H' as isize,
    /// Two length-prefixed strings: field name, field data.
    FormField = b'F' as isize,
    /// Three length-prefixed strings (field name, share name, user
    /// visible file name) followed by a 32-bit shared mapping size.
    Attachment = b'A' as isize,
    /// Bare. Submits the request as built so far.
    Submit = b'R' as isize,
}

impl TryFrom<u8> for RequestCode {
    type Error = anyhow::Error;

    fn try_from(v: u8) -> anyhow::Result<Self> {
        match v {
            b'U' => Ok(RequestCode::SetUrl),
            b'H' => Ok(RequestCode::AddHeader),
            b'F' => Ok(RequestCode::FormField),
            b'A' => Ok(RequestCode::Attachment),
            b'R' => Ok(RequestCode::Submit),
            _ => Err(anyhow!("unknown request code 0x{:02x}", v)),
        }
    }
}

/// ReplyCode tags the frames the daemon streams back after a submit.
///
/// The daemon emits `HttpStatus` at most once and always first, then
/// zero or more `Body`/`Attachment` frames in the server's multipart
/// order, then exactly one of the three terminals.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReplyCode {
    /// 16-bit HTTP status code.
    HttpStatus = b'R' as isize,
    /// A message part held in memory: raw part headers plus payload.
    Body = b'D' as isize,
    /// A message part that was saved to file: raw part headers, the
    /// server-supplied file name, and the temp path holding the bytes.
    Attachment = b'A' as isize,
    /// Terminal: the whole response was seen.
    Complete = b'C' as isize,
    /// Terminal: the response ended before its declared end.
    Incomplete = b'E' as isize,
    /// Terminal: the request could not be performed at all.
    Failed = b'F' as isize,
}

impl TryFrom<u8> for ReplyCode {
    type Error = anyhow::Error;

    fn try_from(v: u8) -> anyhow::Result<Self> {
        match v {
            b'R' => Ok(ReplyCode::HttpStatus),
            b'D' => Ok(ReplyCode::Body),
            b'A' => Ok(ReplyCode::Attachment),
            b'C' => Ok(ReplyCode::Complete),
            b'E' => Ok(ReplyCode::Incomplete),
            b'F' => Ok(ReplyCode::Failed),
            _ => Err(anyhow!("unknown reply code 0x{:02x}", v)),
        }
    }
}

/// One decoded daemon reply frame, as surfaced to client code.
#[derive(Debug, PartialEq)]
pub enum Reply {
    HttpStatus(u16),
    Body { headers: Vec<u8>, data: Vec<u8> },
    Attachment { headers: Vec<u8>, filename: String, tmp_path: PathBuf },
    Complete,
    Incomplete,
    Failed,
}

impl Reply {
    /// A terminal reply ends the response; the session becomes
    /// reusable once one has been observed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Reply::Complete | Reply::Incomplete | Reply::Failed)
    }

    pub fn code(&self) -> ReplyCode {
        match self {
            Reply::HttpStatus(_) => ReplyCode::HttpStatus,
            Reply::Body { .. } => ReplyCode::Body,
            Reply::Attachment { .. } => ReplyCode::Attachment,
            Reply::Complete => ReplyCode::Complete,
            Reply::Incomplete => ReplyCode::Incomplete,
            Reply::Failed => ReplyCode::Failed,
        }
    }

    /// Read one whole reply frame. Blocks until the frame is complete,
    /// so this is only suitable for the client side of the socket.
    pub fn read_from<R>(r: &mut R) -> anyhow::Result<Self>
    where
        R: Read,
    {
        let code = ReplyCode::try_from(r.read_u8()?)?;
        match code {
            ReplyCode::Complete => Ok(Reply::Complete),
            ReplyCode::Incomplete => Ok(Reply::Incomplete),
            ReplyCode::Failed => Ok(Reply::Failed),
            ReplyCode::HttpStatus => Ok(Reply::HttpStatus(r.read_u16::<LittleEndian>()?)),
            ReplyCode::Body => {
                let headersize = r.read_u32::<LittleEndian>()? as usize;
                let datasize = r.read_u32::<LittleEndian>()? as usize;
                let headers = read_exact_vec(r, headersize)?;
                let data = read_exact_vec(r, datasize)?;
                Ok(Reply::Body { headers, data })
            }
            ReplyCode::Attachment => {
                let headersize = r.read_u32::<LittleEndian>()? as usize;
                let filenamesize = r.read_u32::<LittleEndian>()? as usize;
                let tmpnamesize = r.read_u32::<LittleEndian>()? as usize;
                let headers = read_exact_vec(r, headersize)?;
                let filename = String::from_utf8(read_exact_vec(r, filenamesize)?)?;
                let tmp_path = String::from_utf8(read_exact_vec(r, tmpnamesize)?)?;
                Ok(Reply::Attachment { headers, filename, tmp_path: PathBuf::from(tmp_path) })
            }
        }
    }

    /// Write one whole reply frame. The daemon streams frames through
    /// its non-blocking send machine instead; this encoder backs the
    /// no-daemon mode and the tests.
    pub fn write_to<W>(&self, w: &mut W) -> io::Result<()>
    where
        W: Write,
    {
        w.write_u8(self.code() as u8)?;
        match self {
            Reply::Complete | Reply::Incomplete | Reply::Failed => {}
            Reply::HttpStatus(code) => w.write_u16::<LittleEndian>(*code)?,
            Reply::Body { headers, data } => {
                w.write_u32::<LittleEndian>(headers.len() as u32)?;
                w.write_u32::<LittleEndian>(data.len() as u32)?;
                w.write_all(headers)?;
                w.write_all(data)?;
            }
            Reply::Attachment { headers, filename, tmp_path } => {
                let tmp = tmp_path.to_string_lossy();
                w.write_u32::<LittleEndian>(headers.len() as u32)?;
                w.write_u32::<LittleEndian>(filename.len() as u32)?;
                w.write_u32::<LittleEndian>(tmp.len() as u32)?;
                w.write_all(headers)?;
                w.write_all(filename.as_bytes())?;
                w.write_all(tmp.as_bytes())?;
            }
        }
        Ok(())
    }
}

fn read_exact_vec<R>(r: &mut R, len: usize) -> io::Result<Vec<u8>>
where
    R: Read,
{
    let mut buf = vec![0; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_str<W>(w: &mut W, s: &[u8]) -> io::Result<()>
where
    W: Write,
{
    w.write_u32::<LittleEndian>(s.len() as u32)?;
    w.write_all(s)?;
    Ok(())
}

/// `U`: replace the session URL, discarding any cached response.
pub fn write_set_url<W>(w: &mut W, url: &str) -> io::Result<()>
where
    W: Write,
{
    w.write_u8(RequestCode::SetUrl as u8)?;
    write_str(w, url.as_bytes())
}

/// `H`: append one raw header line to the request.
pub fn write_add_header<W>(w: &mut W, header: &str) -> io::Result<()>
where
    W: Write,
{
    w.write_u8(RequestCode::AddHeader as u8)?;
    write_str(w, header.as_bytes())
}

/// `F`: append one multipart form field.
pub fn write_form_field<W>(w: &mut W, name: &str, data: &[u8]) -> io::Result<()>
where
    W: Write,
{
    w.write_u8(RequestCode::FormField as u8)?;
    write_str(w, name.as_bytes())?;
    write_str(w, data)
}

/// `A`: attach a shared artifact to the request form. `map_size` is
/// the total size of the shared mapping, header included, so the
/// daemon can map the region without reading it first.
pub fn write_attachment<W>(
    w: &mut W,
    name: &str,
    share_name: &str,
    filename: &str,
    map_size: u32,
) -> io::Result<()>
where
    W: Write,
{
    w.write_u8(RequestCode::Attachment as u8)?;
    write_str(w, name.as_bytes())?;
    write_str(w, share_name.as_bytes())?;
    write_str(w, filename.as_bytes())?;
    w.write_u32::<LittleEndian>(map_size)
}

/// `R`: submit the request as built so far.
pub fn write_submit<W>(w: &mut W) -> io::Result<()>
where
    W: Write,
{
    w.write_u8(RequestCode::Submit as u8)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reply_round_trip() {
        let cases = vec![
            Reply::HttpStatus(200),
            Reply::HttpStatus(403),
            Reply::Body { headers: vec![], data: b"{\"result\":\"success\"}".to_vec() },
            Reply::Body { headers: b"Content-Type: application/json".to_vec(), data: vec![0, 1] },
            Reply::Attachment {
                headers: b"Content-Disposition: attachment; filename=object".to_vec(),
                filename: String::from("object"),
                tmp_path: PathBuf::from("/tmp/download.object.abc123"),
            },
            Reply::Complete,
            Reply::Incomplete,
            Reply::Failed,
        ];

        for reply in cases {
            let mut buf = Cursor::new(vec![]);
            reply.write_to(&mut buf).expect("write to succeed");
            buf.set_position(0);
            let round_tripped = Reply::read_from(&mut buf).expect("parse to succeed");
            assert_eq!(reply, round_tripped);
        }
    }

    #[test]
    fn request_encodings() {
        let mut buf = vec![];
        write_set_url(&mut buf, "https://h/v1.0/cache/abcd-xyz").expect("write");
        assert_eq!(buf[0], b'U');
        assert_eq!(&buf[1..5], &29u32.to_le_bytes());
        assert_eq!(&buf[5..], b"https://h/v1.0/cache/abcd-xyz");

        let mut buf = vec![];
        write_form_field(&mut buf, "data", b"{}").expect("write");
        assert_eq!(buf[0], b'F');
        assert_eq!(&buf[1..5], &4u32.to_le_bytes());
        assert_eq!(&buf[5..9], b"data");
        assert_eq!(&buf[9..13], &2u32.to_le_bytes());
        assert_eq!(&buf[13..], b"{}");

        let mut buf = vec![];
        write_attachment(&mut buf, "object", "/ccpool-1", "obj.o", 4096).expect("write");
        assert_eq!(buf[0], b'A');
        assert_eq!(&buf[buf.len() - 4..], &4096u32.to_le_bytes());

        let mut buf = vec![];
        write_submit(&mut buf).expect("write");
        assert_eq!(buf, b"R");
    }

    #[test]
    fn unknown_codes_rejected() {
        assert!(RequestCode::try_from(b'X').is_err());
        assert!(ReplyCode::try_from(b'Z').is_err());
        let mut buf = Cursor::new(vec![b'Q']);
        assert!(Reply::read_from(&mut buf).is_err());
    }

    #[test]
    fn socket_name_format() {
        assert_eq!(socket_file_name(1000, "buildhost"), "daemon.1000.buildhost.1");
    }
}
