// BSD 2-Clause License
//
// Copyright (c) 2020 Brian Campbell
//
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
// 1. Redistributions of source code must retain the above copyright
// notice, this list of conditions and the following disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright
// notice, this list of conditions and the following disclaimer in the
// documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::artifact::with_suffix;
use crate::checkpoint::Checkpoint;
use crate::error::{CkptError, Result};
use crate::page_store::PageStore;

pub struct BasicBlockIndex {
    addrs: Vec<u64>,
}

impl BasicBlockIndex {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        if data.len() % 8 != 0 {
            return Err(CkptError::malformed(format!(
                "{}: block index length {} is not a multiple of 8",
                path.display(),
                data.len()
            )));
        }
        let addrs = data
            .chunks(8)
            .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            .collect();
        Ok(BasicBlockIndex::from_addrs(addrs))
    }

    pub fn from_addrs(mut addrs: Vec<u64>) -> Self {
        addrs.sort_unstable();
        addrs.dedup();
        BasicBlockIndex { addrs }
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// `(id, count)` for every block executed at least once.
    pub fn frequencies(&self, pages: &PageStore) -> Vec<(usize, u32)> {
        self.addrs
            .iter()
            .enumerate()
            .filter_map(|(i, &addr)| match pages.exec_count(addr) {
                Some(count) if count > 0 => Some((i + 1, count)),
                _ => None,
            })
            .collect()
    }

    /// Write `<prefix>.bb` for a checkpoint that carries execution counts.
    pub fn write(&self, ckpt: &Checkpoint) -> Result<Option<PathBuf>> {
        if !ckpt.pages.has_exec_counts() {
            return Ok(None);
        }
        let path = with_suffix(&ckpt.prefix, ".bb");
        let freqs = self.frequencies(&ckpt.pages);
        fs::write(&path, format!("{}\n", frequency_line(&freqs)))?;
        debug!("Checkpoint {}: {} block(s) in {}", ckpt.index, freqs.len(), path.display());
        Ok(Some(path))
    }
}

pub fn frequency_line(freqs: &[(usize, u32)]) -> String {
    let fields: Vec<String> = freqs.iter().map(|(id, count)| format!(":{}:{}", id, count)).collect();
    format!("T{}", fields.join(" "))
}
