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

//! Shared artifacts: named POSIX shared memory regions that carry an
//! upload payload (an object file, captured stderr) from a short-lived
//! client process to the daemon without copying it through the socket.
//!
//! The region layout is `{ share_name[SHARE_NAME_LEN], size: u64 le,
//! data[size] }`. Embedding the name lets the daemon verify it mapped
//! the region it was asked for before trusting the embedded length.

use std::{
    fs::File,
    io::Write as _,
    os::fd::OwnedFd,
    sync::atomic::{AtomicU32, Ordering},
};

use anyhow::{anyhow, Context};
use byteorder::{ByteOrder, LittleEndian};
use nix::{
    fcntl::OFlag,
    sys::{mman, stat::Mode},
};
use tracing::warn;

/// Fixed size of the embedded share name field, nul padded.
pub const SHARE_NAME_LEN: usize = 64;

const HEADER_LEN: usize = SHARE_NAME_LEN + 8;

static SHARE_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Generate a share name unique within the host. shm object names
/// must start with '/' and contain no other slashes.
pub fn fresh_share_name() -> String {
    format!(
        "/ccpool-{}-{}-{}",
        nix::unistd::geteuid().as_raw(),
        std::process::id(),
        SHARE_COUNTER.fetch_add(1, Ordering::Relaxed),
    )
}

/// A shared artifact created and owned by a client process. The shm
/// object is unlinked when this is dropped, so the owner must keep it
/// alive until a terminal response frame has been observed for every
/// request that references it.
#[derive(Debug)]
pub struct StashedFile {
    share_name: String,
    payload_len: usize,
}

impl StashedFile {
    pub fn create(share_name: &str, payload: &[u8]) -> anyhow::Result<StashedFile> {
        if share_name.len() >= SHARE_NAME_LEN {
            return Err(anyhow!("share name '{}' too long", share_name));
        }

        let fd = mman::shm_open(
            share_name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .context("creating shared memory object")?;
        let mut file = File::from(fd);

        let mut header = [0u8; HEADER_LEN];
        header[..share_name.len()].copy_from_slice(share_name.as_bytes());
        LittleEndian::write_u64(&mut header[SHARE_NAME_LEN..], payload.len() as u64);

        let written = file.write_all(&header).and_then(|_| file.write_all(payload));
        if let Err(e) = written {
            // don't leave a half-written object behind
            let _ = mman::shm_unlink(share_name);
            return Err(e).context("writing shared memory object");
        }

        Ok(StashedFile { share_name: String::from(share_name), payload_len: payload.len() })
    }

    pub fn share_name(&self) -> &str {
        &self.share_name
    }

    /// The total mapping size communicated to the daemon: header plus
    /// payload.
    pub fn map_size(&self) -> u32 {
        (HEADER_LEN + self.payload_len) as u32
    }
}

impl Drop for StashedFile {
    fn drop(&mut self) {
        if let Err(e) = mman::shm_unlink(self.share_name.as_str()) {
            warn!("unlinking shared object {}: {}", self.share_name, e);
        }
    }
}

/// A read-only view of an existing shared artifact, as established by
/// the daemon while serving a request. The mapping is released when
/// the last reference drops, whether the request completed or the
/// owning client died.
#[derive(Debug)]
pub struct SharedMapping {
    map: memmap2::Mmap,
    payload_len: usize,
}

impl SharedMapping {
    /// Map the named region read-only and verify the embedded share
    /// name before trusting the embedded payload length.
    pub fn open(share_name: &str, map_size: usize) -> anyhow::Result<SharedMapping> {
        if map_size < HEADER_LEN {
            return Err(anyhow!("mapping of {} bytes too small for artifact header", map_size));
        }

        let fd: OwnedFd = mman::shm_open(share_name, OFlag::O_RDONLY, Mode::S_IRUSR)
            .context("opening shared memory object")?;
        let file = File::from(fd);
        // Safety: the region is mapped read-only and stays mapped for
        // the lifetime of the Mmap; the owning client keeps the object
        // alive until we report a terminal, so the contents are stable.
        let map = unsafe { memmap2::MmapOptions::new().len(map_size).map(&file) }
            .context("mapping shared memory object")?;

        let embedded_name = &map[..SHARE_NAME_LEN];
        let embedded_name = match embedded_name.iter().position(|b| *b == 0) {
            Some(n) => &embedded_name[..n],
            None => embedded_name,
        };
        if embedded_name != share_name.as_bytes() {
            return Err(anyhow!(
                "shared object name mismatch: asked for '{}', mapped '{}'",
                share_name,
                String::from_utf8_lossy(embedded_name),
            ));
        }

        let payload_len = LittleEndian::read_u64(&map[SHARE_NAME_LEN..HEADER_LEN]) as usize;
        if HEADER_LEN + payload_len > map_size {
            return Err(anyhow!(
                "shared object '{}' declares {} payload bytes but only {} are mapped",
                share_name,
                payload_len,
                map_size - HEADER_LEN,
            ));
        }

        Ok(SharedMapping { map, payload_len })
    }

    pub fn payload(&self) -> &[u8] {
        &self.map[HEADER_LEN..HEADER_LEN + self.payload_len]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn create_map_round_trip() {
        let name = fresh_share_name();
        let payload = b"\x7fELF fake object bytes";
        let stashed = StashedFile::create(&name, payload).expect("create to succeed");
        assert_eq!(stashed.map_size() as usize, HEADER_LEN + payload.len());

        let mapping =
            SharedMapping::open(&name, stashed.map_size() as usize).expect("open to succeed");
        assert_eq!(mapping.payload(), payload);
    }

    #[test]
    fn name_mismatch_refused() {
        // build a region by hand whose embedded name does not match
        // the name it is mapped under
        let name = fresh_share_name();
        let fd = mman::shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .expect("shm_open to succeed");
        let mut file = File::from(fd);
        let mut header = [0u8; HEADER_LEN];
        header[..7].copy_from_slice(b"/decoy!");
        LittleEndian::write_u64(&mut header[SHARE_NAME_LEN..], 0);
        file.write_all(&header).expect("write to succeed");

        assert!(SharedMapping::open(&name, HEADER_LEN).is_err());
        mman::shm_unlink(name.as_str()).expect("unlink to succeed");

        // a name that maps to nothing fails outright
        assert!(SharedMapping::open("/ccpool-does-not-exist", HEADER_LEN + 4).is_err());
    }

    #[test]
    fn unlinked_on_drop() {
        let name = fresh_share_name();
        {
            let _stashed = StashedFile::create(&name, b"x").expect("create to succeed");
        }
        assert!(SharedMapping::open(&name, HEADER_LEN + 1).is_err());
    }

    #[test]
    fn oversized_declared_length_refused() {
        let name = fresh_share_name();
        let stashed = StashedFile::create(&name, b"abcd").expect("create to succeed");
        // lie about the mapping size: embedded length no longer fits
        assert!(SharedMapping::open(&name, HEADER_LEN + 2).is_err());
        drop(stashed);
    }
}
