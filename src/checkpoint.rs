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
use std::path::PathBuf;

use crate::artifact::Artifact;
use crate::error::{CkptError, Result};
use crate::page_store::PageStore;
use crate::replay_table::{StoreAssertion, SysCall};

/// 32 integer registers followed by 32 floating point registers.
pub const NUM_REGS: usize = 64;
/// Slot of `x0`, which holds the resume PC in a register snapshot.
pub const REG_PC: usize = 0;
pub const REG_SP: usize = 2;
/// `a0`, which carries the entry trampoline into the far dispatcher.
pub const REG_ENTRY_ARG: usize = 10;

/// Instruction whose execution count is only known at run time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Repeat {
    pub addr: u64,
    pub rd: u8,
    pub count: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Breakpoint {
    Trap(u64),
    Repeat(Repeat),
}

pub struct Checkpoint {
    pub index: usize,
    pub entry_pc: u64,
    pub regs: Vec<u64>,
    pub syscalls: Vec<SysCall>,
    pub breakpoint: Option<Breakpoint>,
    pub pages: PageStore,
    pub stores: Vec<StoreAssertion>,
    pub prefix: PathBuf,
}

impl Checkpoint {
    pub fn new(index: usize, entry_pc: u64, prefix: PathBuf) -> Self {
        Checkpoint {
            index,
            entry_pc,
            regs: Vec::with_capacity(NUM_REGS),
            syscalls: Vec::new(),
            breakpoint: None,
            pages: PageStore::new(),
            stores: Vec::new(),
            prefix,
        }
    }

    pub fn reg_file(&self) -> Result<[u64; NUM_REGS]> {
        if self.regs.len() != NUM_REGS {
            return Err(CkptError::malformed(format!(
                "Checkpoint {} has {} register values, expected {}",
                self.index,
                self.regs.len(),
                NUM_REGS
            )));
        }
        let mut regs = [0; NUM_REGS];
        regs.copy_from_slice(&self.regs);
        Ok(regs)
    }

    pub fn repeat(&self) -> Option<Repeat> {
        match self.breakpoint {
            Some(Breakpoint::Repeat(repeat)) => Some(repeat),
            _ => None,
        }
    }

    /// Recorded syscalls, ending with an exit at a plain breakpoint if the
    /// checkpoint has one.
    pub fn events(&self) -> Vec<SysCall> {
        let mut events = self.syscalls.clone();
        if let Some(Breakpoint::Trap(addr)) = self.breakpoint {
            events.push(SysCall::exit(addr))
        }
        events
    }

    /// Pass whose artifact is the final product of this checkpoint.
    pub fn final_pass(&self) -> u32 {
        if self.repeat().is_some() {
            2
        } else {
            1
        }
    }

    pub fn artifact(&self, pass: u32) -> Artifact {
        Artifact::new(&self.prefix, pass)
    }

    pub fn is_built(&self) -> bool {
        (1..=self.final_pass()).all(|pass| self.artifact(pass).exists())
    }

    /// Trap sites and whether any event there steers its value into an
    /// alternate register.
    pub fn trap_sites(events: &[SysCall]) -> BTreeMap<u64, Option<u8>> {
        let mut sites = BTreeMap::new();
        for event in events {
            let site = sites.entry(event.addr).or_insert(None);
            if event.alt_rd.is_some() {
                *site = event.alt_rd
            }
        }
        sites
    }
}
