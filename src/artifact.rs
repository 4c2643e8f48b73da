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

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{CkptError, Result};
use crate::page_store::{Dump, Run};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    pub cfg: PathBuf,
    pub dump: PathBuf,
}

pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

impl Artifact {
    pub fn new(prefix: &Path, pass: u32) -> Self {
        Artifact {
            cfg: with_suffix(prefix, &format!(".{}.cfg", pass)),
            dump: with_suffix(prefix, &format!(".{}.dump", pass)),
        }
    }

    /// The config is renamed into place last, so its presence means the
    /// pair is complete.
    pub fn exists(&self) -> bool {
        self.cfg.is_file() && self.dump.is_file()
    }

    pub fn write(&self, dump: &Dump, regs_addr: u64) -> Result<()> {
        let dump_tmp = with_suffix(&self.dump, ".tmp");
        let cfg_tmp = with_suffix(&self.cfg, ".tmp");

        fs::write(&dump_tmp, &dump.data)?;
        let mut cfg = BufWriter::new(File::create(&cfg_tmp)?);
        write_config(&mut cfg, &dump.runs, regs_addr)?;
        cfg.flush()?;
        drop(cfg);

        fs::rename(&dump_tmp, &self.dump)?;
        fs::rename(&cfg_tmp, &self.cfg)?;
        Ok(())
    }

    pub fn load(&self) -> Result<(Vec<Run>, Vec<u8>, u64)> {
        let (runs, regs_addr) = parse_config(&fs::read_to_string(&self.cfg)?)?;
        let data = fs::read(&self.dump)?;
        Ok((runs, data, regs_addr))
    }
}

pub fn write_config<W: Write>(w: &mut W, runs: &[Run], regs_addr: u64) -> Result<()> {
    writeln!(w, "{}", runs.len())?;
    for run in runs {
        writeln!(w, "{:x}\t{:x}\t{:x}\t{:x}", run.addr, run.offset, run.size, run.length)?;
    }
    writeln!(w, "{:x}", regs_addr)?;
    Ok(())
}

fn hex(field: &str) -> Result<u64> {
    u64::from_str_radix(field, 16).map_err(|_| CkptError::malformed(format!("Bad hex field in config: {}", field)))
}

pub fn parse_config(text: &str) -> Result<(Vec<Run>, u64)> {
    let mut lines = text.lines();
    let count: usize = lines
        .next()
        .and_then(|l| l.trim().parse().ok())
        .ok_or_else(|| CkptError::malformed("Expected run count"))?;
    let mut runs = Vec::with_capacity(count);
    for _ in 0..count {
        let line = lines.next().ok_or_else(|| CkptError::malformed("Expected run"))?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(CkptError::malformed(format!("Bad run: {}", line)));
        }
        runs.push(Run { addr: hex(fields[0])?, offset: hex(fields[1])?, size: hex(fields[2])?, length: hex(fields[3])? })
    }
    let regs = lines.next().ok_or_else(|| CkptError::malformed("Expected register file address"))?;
    Ok((runs, hex(regs.trim())?))
}
