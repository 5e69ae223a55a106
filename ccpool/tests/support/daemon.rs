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
    fs,
    os::unix::net::UnixStream,
    path::PathBuf,
    process,
    process::{Command, Stdio},
    time,
};

use anyhow::Context;
use tempfile::TempDir;

use super::ccpool_bin;

/// Proc is a helper handle for a `ccpool daemon` subprocess.
/// It kills the subprocess when it goes out of scope.
pub struct Proc {
    pub proc: process::Child,
    pub cache_dir: PathBuf,
    pub socket_path: PathBuf,
    pub log_file: PathBuf,
    _tmp_dir: TempDir,
}

impl Proc {
    pub fn new() -> anyhow::Result<Proc> {
        let tmp_dir = tempfile::Builder::new()
            .prefix("ccpool-test")
            .rand_bytes(20)
            .tempdir()
            .context("creating tmp dir")?;
        let cache_dir = tmp_dir.path().join("cache");
        fs::create_dir_all(&cache_dir).context("creating cache dir")?;
        let log_file = tmp_dir.path().join("daemon.log");
        eprintln!("spawning daemon proc with log {:?}", &log_file);

        let mut cmd = Command::new(ccpool_bin());
        cmd.stdout(Stdio::null())
            .stderr(Stdio::null())
            .arg("-vv")
            .arg("--log-file")
            .arg(&log_file)
            .arg("daemon")
            .env("CCPOOL_CACHE_DIR", &cache_dir)
            // a concurrently running idle-timeout test must not
            // shorten this daemon's life
            .env_remove("CCPOOL__INTERNAL__IDLE_TIMEOUT_MS");
        let proc = cmd.spawn().context("spawning daemon process")?;

        let config = libccpool::Config {
            cache_dir: Some(cache_dir.to_string_lossy().into_owned()),
            ..Default::default()
        };
        let socket_path = libccpool::socket_path(&config).context("computing socket path")?;

        // spin until we can dial the socket successfully
        super::wait_until(|| Ok(UnixStream::connect(&socket_path).is_ok()))
            .context("waiting for daemon to come up")?;

        Ok(Proc { proc, cache_dir, socket_path, log_file, _tmp_dir: tmp_dir })
    }

    pub fn config(&self) -> libccpool::Config {
        libccpool::Config {
            cache_dir: Some(self.cache_dir.to_string_lossy().into_owned()),
            ..Default::default()
        }
    }

    pub fn dump_log(&self) {
        if let Ok(log) = fs::read_to_string(&self.log_file) {
            eprintln!("daemon log:\n{}", log);
        }
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if let Err(e) = self.proc.kill() {
            eprintln!("killing daemon proc: {:?}", e);
        }
        let _ = self.proc.wait();
        // give the kernel a beat to release the socket
        std::thread::sleep(time::Duration::from_millis(10));
    }
}
