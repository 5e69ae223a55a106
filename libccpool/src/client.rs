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

//! The client side of the daemon socket: build a request frame by
//! frame, submit it, then iterate the reply frames to a terminal.
//! If no daemon is listening, one is launched and the connect is
//! retried for up to two seconds.
//!
//! With the `nodaemon` feature the same surface performs the HTTPS
//! call in-process instead; callers cannot tell the difference.

use std::path::PathBuf;

use anyhow::Context;

use crate::config::Config;
pub use ccpool_protocol::Reply;

/// The path of the daemon socket for this cache dir, user and host.
pub fn socket_path(config: &Config) -> anyhow::Result<PathBuf> {
    let cache_dir = config.cache_dir();
    // the daemon detaches and changes directory, so pin the path down
    let cache_dir = cache_dir.canonicalize().unwrap_or(cache_dir);
    let hostname =
        nix::unistd::gethostname().context("reading host name")?.to_string_lossy().into_owned();
    let euid = nix::unistd::geteuid().as_raw();
    Ok(cache_dir.join(ccpool_protocol::socket_file_name(euid, &hostname)))
}

#[cfg(not(feature = "nodaemon"))]
pub use daemon_client::DaemonClient;
#[cfg(feature = "nodaemon")]
pub use local_client::DaemonClient;

#[cfg(not(feature = "nodaemon"))]
mod daemon_client {
    use std::{
        env, fs,
        os::unix::net::UnixStream,
        process, thread,
        time::Instant,
    };

    use anyhow::{anyhow, Context};
    use ccpool_protocol as protocol;
    use tracing::{info, instrument, warn};

    use super::{socket_path, Reply};
    use crate::{config::Config, consts, share::StashedFile};

    pub struct DaemonClient {
        stream: UnixStream,
    }

    impl DaemonClient {
        /// Connect to the daemon serving this cache directory,
        /// launching one first if the socket is dead or missing.
        ///
        /// Callers attaching shared artifacts must keep them alive
        /// until a terminal reply has been observed.
        #[instrument(skip_all)]
        pub fn connect(config: &Config) -> anyhow::Result<DaemonClient> {
            let path = socket_path(config)?;
            let start = Instant::now();

            let stream = match UnixStream::connect(&path) {
                Ok(stream) => stream,
                Err(e) => {
                    info!("couldn't connect to {:?}: {}", path, e);
                    info!("attempting to launch a fresh daemon");
                    let _ = fs::remove_file(&path);
                    launch_daemon(config)?;

                    // try repeatedly for two seconds at 0.01s intervals
                    let mut connected = None;
                    for _ in 0..consts::CONNECT_RETRIES {
                        if let Ok(stream) = UnixStream::connect(&path) {
                            connected = Some(stream);
                            break;
                        }
                        thread::sleep(consts::CONNECT_RETRY_INTERVAL);
                    }
                    connected.ok_or_else(|| {
                        anyhow!("could not connect to daemon at {:?} after 2 seconds", path)
                    })?
                }
            };

            info!("daemon connect time: {:?}", start.elapsed());
            Ok(DaemonClient { stream })
        }

        /// Set the request URL, discarding any cached response.
        pub fn set_url(&mut self, url: &str) -> anyhow::Result<()> {
            protocol::write_set_url(&mut self.stream, url).context("sending set-url")
        }

        /// Append a raw header line to the request. Headers persist
        /// across requests on the same connection.
        pub fn add_header(&mut self, header: &str) -> anyhow::Result<()> {
            protocol::write_add_header(&mut self.stream, header).context("sending add-header")
        }

        /// Append a form field; the request becomes a POST.
        pub fn add_form_field(&mut self, name: &str, data: &[u8]) -> anyhow::Result<()> {
            protocol::write_form_field(&mut self.stream, name, data)
                .context("sending form field")
        }

        /// Attach a staged shared artifact to the request form.
        pub fn add_form_attachment(
            &mut self,
            name: &str,
            stashed: &StashedFile,
            filename: &str,
        ) -> anyhow::Result<()> {
            protocol::write_attachment(
                &mut self.stream,
                name,
                stashed.share_name(),
                filename,
                stashed.map_size(),
            )
            .context("sending attachment")
        }

        /// Submit the request; the daemon starts streaming replies.
        pub fn submit(&mut self) -> anyhow::Result<()> {
            protocol::write_submit(&mut self.stream).context("sending submit")
        }

        /// The next reply frame. A broken socket reads as an
        /// incomplete response; the caller sees a terminal either way.
        pub fn next_reply(&mut self) -> Reply {
            match Reply::read_from(&mut self.stream) {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("reading daemon reply: {:?}", e);
                    Reply::Incomplete
                }
            }
        }

        /// Consume unwanted remaining replies so they don't bleed
        /// into the next request. Do NOT call this once a terminal
        /// has already been received.
        pub fn drain(&mut self) {
            loop {
                if self.next_reply().is_terminal() {
                    return;
                }
            }
        }

        /// Hang up. The daemon tears the session down; dropping the
        /// client does the same.
        pub fn close(self) {}
    }

    /// Launch the daemon process in the background. Under test the
    /// binary comes from an env override because the current exe is
    /// the test harness.
    fn launch_daemon(config: &Config) -> anyhow::Result<()> {
        let bin = match env::var(consts::BIN_VAR) {
            Ok(bin) => std::path::PathBuf::from(bin),
            Err(_) => env::current_exe().context("resolving current executable")?,
        };

        let cache_dir = config.cache_dir();
        fs::create_dir_all(&cache_dir).context("creating cache directory")?;
        let log_file = cache_dir.join("daemon.log");

        let mut cmd = process::Command::new(bin);
        if let Some(config_file) = &config.source_file {
            cmd.arg("--config-file").arg(config_file);
        }
        cmd.arg("--log-file")
            .arg(log_file)
            .arg("daemon")
            .env(consts::AUTODAEMONIZE_VAR, "true")
            .stdout(process::Stdio::null())
            .stderr(process::Stdio::null())
            .spawn()
            .context("launching background daemon")?;
        info!("launched background daemon");

        Ok(())
    }
}

#[cfg(feature = "nodaemon")]
mod local_client {
    use std::{collections::VecDeque, path::PathBuf, sync::Arc};

    use anyhow::Context;
    use tracing::{info, warn};

    use super::Reply;
    use crate::{
        config::Config,
        share::{SharedMapping, StashedFile},
        upstream::{self, FormAttachment, FormPayload, RequestSpec},
    };

    /// The no-daemon rendition of the client: the same operations,
    /// served by an in-process upstream handle.
    pub struct DaemonClient {
        client: reqwest::blocking::Client,
        temp_dir: PathBuf,
        url: Option<String>,
        headers: Vec<String>,
        fields: Vec<(String, Vec<u8>)>,
        attachments: Vec<FormAttachment>,
        pending: VecDeque<Reply>,
    }

    impl DaemonClient {
        pub fn connect(config: &Config) -> anyhow::Result<DaemonClient> {
            info!("daemon disabled at build time, going direct");
            Ok(DaemonClient {
                client: upstream::build_client().context("building upstream client")?,
                temp_dir: config.temp_dir(),
                url: None,
                headers: vec![],
                fields: vec![],
                attachments: vec![],
                pending: VecDeque::new(),
            })
        }

        pub fn set_url(&mut self, url: &str) -> anyhow::Result<()> {
            self.pending.clear();
            self.url = Some(String::from(url));
            Ok(())
        }

        pub fn add_header(&mut self, header: &str) -> anyhow::Result<()> {
            self.pending.clear();
            self.headers.push(String::from(header));
            Ok(())
        }

        pub fn add_form_field(&mut self, name: &str, data: &[u8]) -> anyhow::Result<()> {
            self.pending.clear();
            self.fields.push((String::from(name), data.to_vec()));
            Ok(())
        }

        pub fn add_form_attachment(
            &mut self,
            name: &str,
            stashed: &StashedFile,
            filename: &str,
        ) -> anyhow::Result<()> {
            self.pending.clear();
            let mapping =
                SharedMapping::open(stashed.share_name(), stashed.map_size() as usize)
                    .context("mapping shared artifact")?;
            self.attachments.push(FormAttachment {
                field_name: String::from(name),
                filename: String::from(filename),
                mapping: Arc::new(mapping),
            });
            Ok(())
        }

        pub fn submit(&mut self) -> anyhow::Result<()> {
            let Some(url) = self.url.take() else {
                self.pending = VecDeque::from(vec![Reply::Failed]);
                return Ok(());
            };
            let spec = RequestSpec {
                url,
                headers: self.headers.clone(),
                form: if self.fields.is_empty() && self.attachments.is_empty() {
                    None
                } else {
                    Some(FormPayload {
                        fields: std::mem::take(&mut self.fields),
                        attachments: std::mem::take(&mut self.attachments),
                    })
                },
                temp_dir: self.temp_dir.clone(),
            };
            self.fields.clear();
            self.attachments.clear();

            match upstream::perform(&self.client, spec) {
                Ok(response) => {
                    self.pending = VecDeque::from(response.into_replies());
                }
                Err(e) => {
                    warn!("direct upstream request failed: {:?}", e);
                    self.pending = VecDeque::from(vec![Reply::Failed]);
                }
            }
            Ok(())
        }

        pub fn next_reply(&mut self) -> Reply {
            self.pending.pop_front().unwrap_or(Reply::Failed)
        }

        pub fn drain(&mut self) {
            loop {
                if self.next_reply().is_terminal() {
                    return;
                }
            }
        }

        pub fn close(self) {}
    }
}
