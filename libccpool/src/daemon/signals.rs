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
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
    thread,
};

use anyhow::Context;
use signal_hook::{
    consts::{signal::SIGUSR1, signal::SIGUSR2, TERM_SIGNALS},
    flag,
    iterator::Signals,
};
use tracing::{error, info};

use crate::daemon::stats::Counters;

/// The daemon's signal contract: SIGINT/SIGTERM exit cleanly after
/// removing the socket file, SIGUSR1 dumps the counters to stderr,
/// SIGUSR2 resets them. (SIGPIPE is ignored at startup, client
/// crashes surface through the sockets instead.)
pub struct Handler {
    sock: PathBuf,
    counters: Arc<Counters>,
}

impl Handler {
    pub fn new(sock: PathBuf, counters: Arc<Counters>) -> Self {
        Handler { sock, counters }
    }

    pub fn spawn(self) -> anyhow::Result<()> {
        info!("spawning signal handler thread");

        // This sets us up to shutdown immediately if someone
        // mashes ^C so we don't get stuck attempting a graceful
        // shutdown.
        let term_now = Arc::new(AtomicBool::new(false));
        for sig in TERM_SIGNALS {
            // When terminated by a second term signal, exit with exit code 1.
            // This will do nothing the first time (because term_now is false).
            flag::register_conditional_shutdown(*sig, 1, Arc::clone(&term_now))?;
            // But this will "arm" the above for the second time, by setting it to true.
            // The order of registering these is important, if you put this one first, it
            // will first arm and then terminate ‒ all in the first round.
            flag::register(*sig, Arc::clone(&term_now))?;
        }

        let mut watched = vec![SIGUSR1, SIGUSR2];
        watched.extend_from_slice(TERM_SIGNALS);
        let mut signals = Signals::new(watched).context("creating signal iterator")?;
        thread::spawn(move || {
            for signal in &mut signals {
                match signal {
                    SIGUSR1 => {
                        info!("received SIGUSR1, dumping counters");
                        self.counters.dump();
                    }
                    SIGUSR2 => {
                        info!("received SIGUSR2, resetting counters");
                        self.counters.reset();
                    }
                    _ => {
                        info!("term sig handler: cleaning up socket");
                        if let Err(e) =
                            std::fs::remove_file(&self.sock).context("cleaning up socket")
                        {
                            error!("error cleaning up socket file: {}", e);
                        }

                        info!("term sig handler: exiting");
                        std::process::exit(0);
                    }
                }
            }
        });

        Ok(())
    }
}
