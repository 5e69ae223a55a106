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

//! The cloud cache endpoints, driven through the daemon client:
//! fetching a previously cached build result, and posting a new one
//! (including the server's source-list and file-upload negotiation).
//! Hashing, toolchain identity and the result report itself are the
//! caller's business; this module only moves them over the wire.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use crate::{
    client::DaemonClient,
    config::{CloudMode, Config},
    share::{fresh_share_name, StashedFile},
};
use ccpool_protocol::Reply;

/// Give up renegotiating a POST after this many round trips. The
/// server normally asks for at most one resend with sources and one
/// with file payloads.
const MAX_POST_ATTEMPTS: usize = 5;

/// Artifacts staged for upload, keyed by their original path. Each
/// lives in a shared memory object until the registry drops.
#[derive(Default)]
pub struct Stash {
    files: HashMap<PathBuf, StashedFile>,
}

impl Stash {
    pub fn new() -> Stash {
        Stash::default()
    }

    /// Stage a file's current contents, reusing an existing staging
    /// if the path was stashed before.
    pub fn stash<P: AsRef<Path>>(&mut self, path: P) -> anyhow::Result<&StashedFile> {
        let path = path.as_ref();
        if !self.files.contains_key(path) {
            let payload = fs::read(path)
                .with_context(|| format!("reading {:?} for staging", path))?;
            let stashed = StashedFile::create(&fresh_share_name(), &payload)
                .with_context(|| format!("staging {:?}", path))?;
            self.files.insert(path.to_path_buf(), stashed);
        }
        self.files.get(path).context("freshly stashed file went missing")
    }

    pub fn get<P: AsRef<Path>>(&self, path: P) -> Option<&StashedFile> {
        self.files.get(path.as_ref())
    }
}

/// One source or include file that went into a compilation, with the
/// caller-computed content hash the server matches source sets by.
#[derive(Debug, Clone)]
pub struct SourceEntry {
    pub path: String,
    pub hash: String,
}

/// A finished compilation, as reported to the cache. All fields are
/// caller-built; the hashes and the toolchain id come from outside.
#[derive(Debug, Clone, Default)]
pub struct ResultReport {
    pub cpp_hash: String,
    pub toolchain_id: String,
    pub exit_status: i32,
    pub exit_reason: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub object_path: String,
    /// Where the object file's bytes live locally, if there is one to
    /// upload when the server asks.
    pub object_file: Option<PathBuf>,
    pub stderr: String,
    /// Hash over the sorted source list; the server asks for the full
    /// list only when it doesn't recognize the signature.
    pub source_sig: String,
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PostOutcome {
    /// The server accepted the result.
    Success,
    /// The server rejected the request as malformed.
    ServerError(String),
    /// Gave up: transport trouble or an unintelligible response.
    GivenUp,
}

/// A connection-scoped view of the cloud cache. Carries the user key
/// and a random per-invocation session id so the server can match the
/// GET and POST halves of one compile.
pub struct CloudSession {
    config: Config,
    user_key_header: String,
    session_id_header: String,
}

impl CloudSession {
    /// None in offline mode (asked for, or forced by a missing server
    /// or user key).
    pub fn new(config: &Config) -> Option<CloudSession> {
        if config.cloud_mode() == CloudMode::Offline {
            return None;
        }
        let key = config.cloud_key()?;
        Some(CloudSession {
            config: config.clone(),
            user_key_header: format!("X-USER-KEY: {key}"),
            session_id_header: format!("X-CLIENT-SESSION-ID: {}", rand::random::<u32>()),
        })
    }

    /// Open a daemon session with the auth headers installed. The
    /// headers stick for every request made on this connection.
    fn open(&self) -> anyhow::Result<DaemonClient> {
        let mut client = DaemonClient::connect(&self.config)?;
        client.add_header(&self.user_key_header)?;
        client.add_header(&self.session_id_header)?;
        Ok(client)
    }

    fn server(&self) -> anyhow::Result<String> {
        self.config.cloud_server().context("no cloud server configured")
    }

    /// Fetch a cached build result. On a hit the downloaded object
    /// and stderr land in the given paths and the recorded compiler
    /// exit status is returned; a miss (or any trouble at all) is
    /// `Ok(None)`.
    #[instrument(skip_all, fields(hash = cpp_hash))]
    pub fn cache_get(
        &self,
        cpp_hash: &str,
        toolchain_id: &str,
        object_file: &Path,
        stderr_file: &Path,
    ) -> anyhow::Result<Option<i32>> {
        let url = format!("https://{}/v1.0/cache/{}-{}", self.server()?, cpp_hash, toolchain_id);

        // a dead daemon that can't be relaunched is just a big miss
        let mut client = match self.open() {
            Ok(client) => client,
            Err(e) => {
                warn!("daemon connection failed, treating the cache as offline: {:?}", e);
                return Ok(None);
            }
        };
        if let Err(e) = client.set_url(&url).and_then(|_| client.submit()) {
            warn!("sending cache request to daemon: {:?}", e);
            return Ok(None);
        }

        let mut hit = false;
        let mut exit_status = None;
        loop {
            match client.next_reply() {
                Reply::Failed => {
                    info!("cache get could not reach the server");
                    return Ok(None);
                }
                Reply::Incomplete => {
                    info!("received incomplete response from the server");
                    return Ok(None);
                }
                Reply::Complete => break,
                Reply::HttpStatus(403) => {
                    // the user key was no good
                    eprintln!(
                        "ccpool: error: the configured user key was rejected by the server.\n\
                         Continuing in offline mode ..."
                    );
                    client.drain();
                    return Ok(None);
                }
                Reply::HttpStatus(200) => hit = true,
                Reply::HttpStatus(code) => {
                    info!("cache get returned http status {}", code);
                    client.drain();
                    return Ok(None);
                }
                Reply::Body { headers, data } => {
                    if headers_mention(&headers, "?file=data") {
                        match serde_json::from_slice::<Value>(&data) {
                            Ok(doc) => {
                                exit_status = doc
                                    .get("exit_status")
                                    .and_then(Value::as_i64)
                                    .map(|status| status as i32);
                                if exit_status.is_none() {
                                    warn!("server didn't return the compiler exit_status");
                                }
                            }
                            Err(e) => warn!("could not parse cache data part: {}", e),
                        }
                    } else {
                        warn!("server returned unexpected data part");
                    }
                }
                Reply::Attachment { headers, tmp_path, .. } => {
                    if headers_mention(&headers, "?file=object") {
                        fs::rename(&tmp_path, object_file)
                            .context("moving downloaded object into place")?;
                    } else if headers_mention(&headers, "?file=stderr") {
                        fs::rename(&tmp_path, stderr_file)
                            .context("moving downloaded stderr into place")?;
                    } else {
                        warn!("server returned unexpected attachment, deleting it");
                        let _ = fs::remove_file(&tmp_path);
                    }
                }
            }
        }

        Ok(if hit { Some(exit_status.unwrap_or(0)) } else { None })
    }

    /// Post a finished compilation to the cache, negotiating source
    /// lists and file uploads as the server asks for them. Each round
    /// trip is an independent request on the same daemon session.
    #[instrument(skip_all, fields(hash = %report.cpp_hash))]
    pub fn post_result(
        &self,
        report: &ResultReport,
        stash: &mut Stash,
    ) -> anyhow::Result<PostOutcome> {
        let url = format!("https://{}/v1.0/cache/", self.server()?);
        let mut client = match self.open() {
            Ok(client) => client,
            Err(e) => {
                warn!("daemon connection failed, result will not be posted: {:?}", e);
                return Ok(PostOutcome::GivenUp);
            }
        };

        let mut document = report_document(report);
        // (field name, local path, server-visible filename)
        let mut uploads: Vec<(String, PathBuf, String)> = vec![];

        for _attempt in 0..MAX_POST_ATTEMPTS {
            let sent = (|| -> anyhow::Result<()> {
                client.set_url(&url)?;
                client.add_form_field("data", document.to_string().as_bytes())?;
                for (field, path, filename) in uploads.iter() {
                    let stashed = stash.stash(path)?;
                    client.add_form_attachment(field, stashed, filename)?;
                }
                client.submit()
            })();
            if let Err(e) = sent {
                warn!("sending post request to daemon: {:?}", e);
                return Ok(PostOutcome::GivenUp);
            }

            let response = match self.read_post_response(&mut client)? {
                Some(doc) => doc,
                None => return Ok(PostOutcome::GivenUp),
            };

            let Some(result) = response.get("result").and_then(Value::as_str) else {
                warn!("server response did not contain 'result'");
                return Ok(PostOutcome::GivenUp);
            };

            match result {
                "success" => {
                    info!("data posted to {}", self.server()?);
                    return Ok(PostOutcome::Success);
                }
                "error" => {
                    let message = response
                        .get("data")
                        .and_then(Value::as_str)
                        .unwrap_or("(no message given)")
                        .to_string();
                    warn!("server reports error: '{}'", message);
                    return Ok(PostOutcome::ServerError(message));
                }
                "source list needed" => {
                    // resend with the full path -> hash map
                    let sources: serde_json::Map<String, Value> = report
                        .sources
                        .iter()
                        .map(|s| (s.path.clone(), Value::String(s.hash.clone())))
                        .collect();
                    info!("resending with full source list ({} files)", sources.len());
                    document["sources"] = Value::Object(sources);
                }
                "files needed" => {
                    uploads = match self.uploads_for(report, &response) {
                        Some(uploads) if !uploads.is_empty() => uploads,
                        _ => return Ok(PostOutcome::GivenUp),
                    };
                }
                other => {
                    warn!("unrecognized server result '{}', giving up", other);
                    return Ok(PostOutcome::GivenUp);
                }
            }
        }

        warn!("post kept renegotiating, giving up");
        Ok(PostOutcome::GivenUp)
    }

    /// Drain one POST response down to its JSON document. `None`
    /// means give up (transport failure, http error, bad JSON).
    fn read_post_response(&self, client: &mut DaemonClient) -> anyhow::Result<Option<Value>> {
        let mut http_error = false;
        let mut document = None;
        loop {
            match client.next_reply() {
                Reply::Failed => {
                    info!("data could not be posted to {}", self.server()?);
                    return Ok(None);
                }
                Reply::Incomplete => {
                    info!("received incomplete response from the server");
                    return Ok(None);
                }
                Reply::Complete => return Ok(document),
                Reply::HttpStatus(code) => {
                    if code != 200 {
                        warn!("server returned error code: {}", code);
                        http_error = true;
                    }
                }
                Reply::Body { data, .. } => {
                    if document.is_some() {
                        warn!("received unexpected multipart response");
                        continue;
                    }
                    if http_error {
                        warn!("server response: '{}'", String::from_utf8_lossy(&data));
                        client.drain();
                        return Ok(None);
                    }
                    match serde_json::from_slice::<Value>(&data) {
                        Ok(doc) => document = Some(doc),
                        Err(_) => {
                            warn!("could not parse server response as JSON");
                            client.drain();
                            return Ok(None);
                        }
                    }
                }
                Reply::Attachment { tmp_path, .. } => {
                    // we're not expecting any!
                    warn!("received unexpected attachment, deleting it");
                    let _ = fs::remove_file(&tmp_path);
                }
            }
        }
    }

    /// Work out which files the server asked for, refusing anything
    /// that wasn't part of this compilation.
    fn uploads_for(
        &self,
        report: &ResultReport,
        response: &Value,
    ) -> Option<Vec<(String, PathBuf, String)>> {
        let Some(requested) = response.get("data").and_then(Value::as_array) else {
            warn!("server requested file uploads, but the filenames were missing");
            return None;
        };

        info!("server requests {} file uploads", requested.len());
        let mut uploads = vec![];
        for entry in requested {
            let Some(filename) = entry.as_str() else {
                continue;
            };
            if filename == report.object_path {
                let Some(object_file) = &report.object_file else {
                    warn!("we don't have an object file to upload");
                    return None;
                };
                uploads.push((
                    String::from("object"),
                    object_file.clone(),
                    String::from(filename),
                ));
            } else if report.sources.iter().any(|s| s.path == filename) {
                uploads.push((
                    String::from("source"),
                    PathBuf::from(filename),
                    String::from(filename),
                ));
            } else {
                // make sure the server isn't requesting bogus files!
                warn!("server requested unexpected file '{}'; bailing out", filename);
                return None;
            }
            info!("...uploading file: '{}'", filename);
        }
        Some(uploads)
    }
}

fn report_document(report: &ResultReport) -> Value {
    json!({
        "cpp_hash": report.cpp_hash,
        "toolchain_id": report.toolchain_id,
        "stderr": report.stderr,
        "exit_status": report.exit_status,
        "exit_reason": report.exit_reason,
        "args": report.args,
        "cwd": report.cwd,
        "object_path": report.object_path,
        "source_sig": report.source_sig,
    })
}

fn headers_mention(headers: &[u8], needle: &str) -> bool {
    String::from_utf8_lossy(headers).contains(needle)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn report_document_covers_the_contract() {
        let report = ResultReport {
            cpp_hash: String::from("abcd"),
            toolchain_id: String::from("xyz"),
            exit_status: 0,
            exit_reason: String::from("ok"),
            args: vec![String::from("cc"), String::from("-c"), String::from("a.c")],
            cwd: String::from("/src"),
            object_path: String::from("/src/a.o"),
            source_sig: String::from("sig"),
            ..Default::default()
        };

        let doc = report_document(&report);
        assert_eq!(doc["cpp_hash"], "abcd");
        assert_eq!(doc["toolchain_id"], "xyz");
        assert_eq!(doc["exit_status"], 0);
        assert_eq!(doc["args"][2], "a.c");
        assert_eq!(doc["source_sig"], "sig");
    }

    #[test]
    fn uploads_refuse_bogus_requests() {
        let config = Config {
            cloud_server: Some(String::from("cache.example.com")),
            cloud_key: Some(String::from("k")),
            ..Default::default()
        };
        let session = CloudSession::new(&config).expect("session to build");

        let report = ResultReport {
            object_path: String::from("/src/a.o"),
            object_file: Some(PathBuf::from("/src/a.o")),
            sources: vec![SourceEntry {
                path: String::from("/src/a.c"),
                hash: String::from("h"),
            }],
            ..Default::default()
        };

        let ok = json!({"result": "files needed", "data": ["/src/a.o", "/src/a.c"]});
        let uploads = session.uploads_for(&report, &ok).expect("uploads to resolve");
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[0].0, "object");
        assert_eq!(uploads[1].0, "source");

        let bogus = json!({"result": "files needed", "data": ["/etc/passwd"]});
        assert!(session.uploads_for(&report, &bogus).is_none());
    }

    #[test]
    fn offline_mode_builds_no_session() {
        let config = Config::default();
        assert!(CloudSession::new(&config).is_none());
    }

    // an unreachable daemon that can't be relaunched must degrade to
    // a miss / a dropped post, never a hard error
    #[test]
    #[cfg(not(feature = "nodaemon"))]
    fn daemon_connect_failure_degrades_gracefully() {
        let tmp_dir = tempfile::Builder::new()
            .prefix("ccpool-test")
            .tempdir()
            .expect("tmp dir to build");

        // make the autolaunch fail fast and deterministically
        std::env::set_var("CCPOOL__INTERNAL__BIN", "/dev/null/ccpool-does-not-exist");

        let config = Config {
            cache_dir: Some(tmp_dir.path().to_string_lossy().into_owned()),
            cloud_server: Some(String::from("cache.example.com")),
            cloud_key: Some(String::from("k")),
            ..Default::default()
        };
        let session = CloudSession::new(&config).expect("session to build");

        let hit = session
            .cache_get("abcd", "xyz", &tmp_dir.path().join("obj"), &tmp_dir.path().join("err"))
            .expect("cache get to degrade, not error");
        assert_eq!(hit, None);

        let mut stash = Stash::new();
        let outcome = session
            .post_result(&ResultReport::default(), &mut stash)
            .expect("post to degrade, not error");
        assert_eq!(outcome, PostOutcome::GivenUp);

        std::env::remove_var("CCPOOL__INTERNAL__BIN");
    }
}
