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

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::debug;
use regex::Regex;

use crate::checkpoint::{Breakpoint, Checkpoint, Repeat};
use crate::error::{CkptError, Result};
use crate::page_store::{Page, Payload, BITMAP_SIZE, EXEC_SLOTS, PAGE_SIZE};
use crate::replay_table::{MemWrite, StoreAssertion, SysCall};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    Begin(u64),
    IntRegs(Vec<u64>),
    FloatRegs(Vec<u64>),
    SysCall(SysCall),
    Break(Breakpoint),
    File(String),
    Page(u64),
    Exec(u64),
    Store(StoreAssertion),
}

fn hex(token: &str) -> std::result::Result<u64, String> {
    lazy_static! {
        static ref HEX: Regex = Regex::new(r"^(0x)?[0-9a-fA-F]{1,16}$").unwrap();
    }
    if !HEX.is_match(token) {
        return Err(format!("Bad hex value: {}", token));
    }
    u64::from_str_radix(token.trim_start_matches("0x"), 16).map_err(|e| format!("Bad hex value {}: {}", token, e))
}

pub(crate) fn retval(token: &str) -> std::result::Result<u64, String> {
    if token.starts_with('-') {
        token.parse::<i64>().map(|v| v as u64).map_err(|e| format!("Bad return value {}: {}", token, e))
    } else {
        hex(token)
    }
}

fn byte_string(token: &str) -> std::result::Result<Vec<u8>, String> {
    if token.len() % 2 != 0 || !token.is_ascii() {
        return Err(format!("Bad write data: {}", token));
    }
    (0..token.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&token[i..i + 2], 16).map_err(|_| format!("Bad write data: {}", token)))
        .collect()
}

fn regs(tokens: &[&str]) -> std::result::Result<Vec<u64>, String> {
    if tokens.len() != 32 {
        return Err(format!("Expected 32 register values, found {}", tokens.len()));
    }
    tokens.iter().map(|t| hex(t)).collect()
}

fn syscall(tokens: &[&str]) -> std::result::Result<SysCall, String> {
    let addr = hex(tokens.get(0).ok_or("Missing syscall address")?)?;
    match tokens[1..] {
        ["exit"] | [_, "exit"] => Ok(SysCall::exit(addr)),
        [value] => Ok(SysCall::ret(addr, retval(value)?)),
        [value, waddr, wdata] => {
            let mut event = SysCall::ret(addr, retval(value)?);
            event.write = Some(MemWrite { addr: hex(waddr)?, data: byte_string(wdata)? });
            Ok(event)
        }
        _ => Err(format!("Bad syscall record: {}", tokens.join(" "))),
    }
}

fn breakpoint(tokens: &[&str]) -> std::result::Result<Breakpoint, String> {
    let addr = hex(tokens.get(0).ok_or("Missing breakpoint address")?)?;
    match tokens[1..] {
        [] | ["ecall"] | ["first"] | ["firstrvc"] => Ok(Breakpoint::Trap(addr)),
        ["repeat", count, rd] => {
            let count = count.parse().map_err(|_| format!("Bad repeat count: {}", count))?;
            let rd = rd.parse().ok().filter(|rd| *rd < 32).ok_or_else(|| format!("Bad register: {}", rd))?;
            Ok(Breakpoint::Repeat(Repeat { addr, rd, count }))
        }
        _ => Err(format!("Bad breakpoint record: {}", tokens.join(" "))),
    }
}

fn store(tokens: &[&str]) -> std::result::Result<StoreAssertion, String> {
    match tokens {
        [addr, value] => {
            let bytes = Payload::Hex(value).to_bytes().map_err(|e| e.to_string())?;
            if ![1, 2, 4, 8].contains(&bytes.len()) {
                return Err(format!("Bad store width {} for {}", bytes.len(), value));
            }
            let mut le = [0u8; 8];
            le[..bytes.len()].copy_from_slice(&bytes);
            Ok(StoreAssertion { addr: hex(addr)?, size: bytes.len() as u64, value: u64::from_le_bytes(le) })
        }
        _ => Err(format!("Bad store record: {}", tokens.join(" "))),
    }
}

impl FromStr for Record {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let tokens: Vec<&str> = s.split_whitespace().collect();
        let (kind, args) = tokens.split_first().ok_or("Empty record")?;
        let one = |args: &[&str]| match args {
            [value] => hex(value),
            _ => Err(format!("Expected one value for {}", kind)),
        };
        Ok(match *kind {
            "begin" => Record::Begin(one(args)?),
            "ireg" => Record::IntRegs(regs(args)?),
            "freg" => Record::FloatRegs(regs(args)?),
            "syscall" => Record::SysCall(syscall(args)?),
            "break" => Record::Break(breakpoint(args)?),
            "file" => match args {
                [path] => Record::File(path.to_string()),
                _ => return Err("Expected a path for file".to_string()),
            },
            "page" => Record::Page(one(args)?),
            "exec" => Record::Exec(one(args)?),
            "store" => Record::Store(store(args)?),
            _ => return Err(format!("Unknown record kind: {}", kind)),
        })
    }
}

fn read_block(dump: &mut Option<BufReader<File>>, len: usize, what: &str) -> Result<Vec<u8>> {
    let dump = dump.as_mut().ok_or_else(|| CkptError::malformed(format!("{} record without a file", what)))?;
    let mut buf = vec![0; len];
    dump.read_exact(&mut buf).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => CkptError::malformed(format!("Truncated {} data", what)),
        _ => CkptError::Io(err),
    })?;
    Ok(buf)
}

/// Output prefix for a `file` record: the path with any `.dump` suffix removed.
pub fn prefix_for(dir: &Path, file: &str) -> PathBuf {
    dir.join(file.strip_suffix(".dump").unwrap_or(file))
}

/// Streams checkpoints out of a trace log, each one complete once the next
/// `begin` record (or the end of the log) is reached.
pub struct TraceReader<R> {
    lines: io::Lines<R>,
    dir: PathBuf,
    stem: String,
    dump: Option<BufReader<File>>,
    cur: Option<Checkpoint>,
    // exec blocks may precede their page
    exec: BTreeMap<u64, Vec<u8>>,
    next_index: usize,
    line_no: usize,
    done: bool,
}

impl TraceReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| "ckpt".to_string());
        Ok(TraceReader::new(BufReader::new(file), dir, stem))
    }
}

impl<R: BufRead> TraceReader<R> {
    /// `dir` resolves `file` records; `stem` names checkpoints that have none.
    pub fn new(reader: R, dir: PathBuf, stem: String) -> Self {
        TraceReader { lines: reader.lines(), dir, stem, dump: None, cur: None, exec: BTreeMap::new(), next_index: 0, line_no: 0, done: false }
    }

    fn finish(&mut self, ckpt: Option<Checkpoint>) -> Result<Option<Checkpoint>> {
        let exec = std::mem::take(&mut self.exec);
        match ckpt {
            Some(mut ckpt) => {
                for (pn, counts) in exec {
                    ckpt.pages.set_exec_counts(pn, &counts)?;
                }
                Ok(Some(ckpt))
            }
            None => Ok(None),
        }
    }

    fn step(&mut self) -> Result<Option<Checkpoint>> {
        loop {
            let line = match self.lines.next() {
                None => {
                    self.dump = None;
                    let last = self.cur.take();
                    return self.finish(last);
                }
                Some(line) => line?,
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let line_no = self.line_no;
            let record: Record =
                line.parse().map_err(|err| CkptError::malformed(format!("line {}: {}", line_no, err)))?;

            if let Record::Begin(pc) = record {
                self.dump = None;
                let prefix = self.dir.join(format!("{}.{}", self.stem, self.next_index));
                let prev = self.cur.replace(Checkpoint::new(self.next_index, pc, prefix));
                self.next_index += 1;
                match prev {
                    Some(prev) => return self.finish(Some(prev)),
                    None => continue,
                }
            }

            let cur = self
                .cur
                .as_mut()
                .ok_or_else(|| CkptError::malformed(format!("line {}: record before begin", line_no)))?;
            match record {
                Record::Begin(_) => unreachable!(),
                Record::IntRegs(values) | Record::FloatRegs(values) => cur.regs.extend(values),
                Record::SysCall(event) => cur.syscalls.push(event),
                Record::Break(bp) => cur.breakpoint = Some(bp),
                Record::Store(assertion) => cur.stores.push(assertion),
                Record::File(path) => {
                    cur.prefix = prefix_for(&self.dir, &path);
                    debug!("Checkpoint {} reads pages from {}", cur.index, path);
                    self.dump = Some(BufReader::new(File::open(self.dir.join(&path))?));
                }
                Record::Page(pn) => {
                    let bitmap = read_block(&mut self.dump, BITMAP_SIZE, "page")?;
                    let data = read_block(&mut self.dump, PAGE_SIZE, "page")?;
                    cur.pages.insert_page(pn, Page::from_parts(&bitmap, &data)?);
                }
                Record::Exec(pn) => {
                    let counts = read_block(&mut self.dump, EXEC_SLOTS * 4, "exec")?;
                    self.exec.insert(pn, counts);
                }
            }
        }
    }
}

impl<R: BufRead> Iterator for TraceReader<R> {
    type Item = Result<Checkpoint>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(ckpt)) => Some(Ok(ckpt)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
