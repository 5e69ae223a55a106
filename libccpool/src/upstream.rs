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

//! One upstream HTTPS handle: a reqwest blocking client configured
//! once, and the driver that performs a single request and streams the
//! body through the response reassembler. The daemon's pool runs one
//! of these per worker; the no-daemon build mode runs one in-process.

use std::{io, io::Read as _, path::PathBuf, sync::Arc};

use anyhow::Context;
use lazy_static::lazy_static;
use reqwest::blocking::multipart;
use tracing::{debug, warn};

use crate::{consts, response::ServerResponse, share::SharedMapping};

lazy_static! {
    static ref USER_AGENT: String = format!(
        "ccpool/{} ({} {})",
        ccpool_protocol::VERSION,
        std::env::consts::OS,
        std::env::consts::ARCH,
    );
}

/// Everything needed to perform one upstream request, detached from
/// the session that built it so the transfer can run on a pool worker.
#[derive(Debug)]
pub struct RequestSpec {
    pub url: String,
    /// Raw `Name: value` header lines, in client order.
    pub headers: Vec<String>,
    /// A request with no form is a GET; anything with form fields or
    /// attachments is a multipart POST.
    pub form: Option<FormPayload>,
    pub temp_dir: PathBuf,
}

#[derive(Debug, Default)]
pub struct FormPayload {
    pub fields: Vec<(String, Vec<u8>)>,
    pub attachments: Vec<FormAttachment>,
}

/// A staged upload: the payload lives in a shared artifact mapping,
/// referenced rather than copied so the transfer reads straight out
/// of the client's region.
#[derive(Debug)]
pub struct FormAttachment {
    pub field_name: String,
    pub filename: String,
    pub mapping: Arc<SharedMapping>,
}

/// Build one reusable upstream client. Persistent connections live
/// inside the client, which is the daemon's whole reason to exist, so
/// each pool handle gets exactly one of these for its lifetime.
pub fn build_client() -> reqwest::Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(consts::UPSTREAM_TIMEOUT)
        .redirect(reqwest::redirect::Policy::limited(10))
        .user_agent(USER_AGENT.as_str())
        .build()
}

struct MappingReader {
    mapping: Arc<SharedMapping>,
    pos: usize,
}

impl io::Read for MappingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let payload = self.mapping.payload();
        let n = std::cmp::min(buf.len(), payload.len() - self.pos);
        buf[..n].copy_from_slice(&payload[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Perform one request to completion, feeding the body through the
/// reassembler in chunks. A transport-level failure (connect, TLS,
/// mid-body I/O, timeout) is an `Err`, which the caller reports as a
/// failed request; a response that arrives but never terminates comes
/// back `Ok` with `complete` unset.
pub fn perform(
    client: &reqwest::blocking::Client,
    spec: RequestSpec,
) -> anyhow::Result<ServerResponse> {
    let mut builder = match spec.form {
        Some(form) => {
            let mut multipart_form = multipart::Form::new();
            for (name, data) in form.fields {
                multipart_form = multipart_form.part(name, multipart::Part::bytes(data));
            }
            for attachment in form.attachments {
                let len = attachment.mapping.payload().len() as u64;
                let reader =
                    MappingReader { mapping: Arc::clone(&attachment.mapping), pos: 0 };
                multipart_form = multipart_form.part(
                    attachment.field_name,
                    multipart::Part::reader_with_length(reader, len)
                        .file_name(attachment.filename),
                );
            }
            client.post(&spec.url).multipart(multipart_form)
        }
        None => client.get(&spec.url),
    };

    for header in spec.headers.iter() {
        match header.split_once(':') {
            Some((name, value)) => {
                builder = builder.header(name.trim(), value.trim());
            }
            None => warn!("skipping malformed header line '{}'", header),
        }
    }

    let mut http_response = builder.send().context("performing upstream request")?;

    let content_type = http_response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let content_length = http_response.content_length();

    let mut response = ServerResponse::new(&spec.temp_dir);
    response.begin(http_response.status().as_u16(), content_type.as_deref(), content_length);
    debug!("upstream status {} type {:?}", response.code, response.mime_type);

    let mut buf = vec![0; consts::BUF_SIZE];
    loop {
        let nread =
            http_response.read(&mut buf).context("reading upstream response body")?;
        if nread == 0 {
            break;
        }
        response.push(&buf[..nread])?;
    }
    response.finish()?;

    Ok(response)
}
