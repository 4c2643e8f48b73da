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

use std::collections::{BTreeMap, HashMap};

use log::{debug, info};

use crate::artifact::Artifact;
use crate::checkpoint::{Checkpoint, NUM_REGS, REG_ENTRY_ARG, REG_PC, REG_SP};
use crate::codegen::{displacement, CodeGen, NearParams};
use crate::error::{CkptError, Result};
use crate::free_list::FreeList;
use crate::page_store::{PageStore, Payload, PAGE_SIZE};
use crate::replay_table::{ReplayTable, SysCall};

/// Bytes set aside at each trap site, enough for either instruction width.
pub const TRAP_WIDTH: u64 = 4;
pub const REGS_SIZE: u64 = NUM_REGS as u64 * 8;
/// Near trampoline temporaries and the far dispatcher's stack.
pub const SCRATCH_SIZE: u64 = PAGE_SIZE as u64;

/// Addresses within the replay-stack region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    pub base: u64,
    pub regs: u64,
    pub saved_sp: u64,
    pub saved_pc: u64,
    pub table: u64,
    pub scratch: u64,
    pub top: u64,
}

impl Layout {
    pub fn size_for(table_len: usize) -> u64 {
        REGS_SIZE + 16 + ((table_len as u64 + 7) & !7) + SCRATCH_SIZE
    }

    pub fn new(base: u64, table_len: usize) -> Self {
        let regs = base;
        let saved_sp = regs + REGS_SIZE;
        let saved_pc = saved_sp + 8;
        let table = saved_pc + 8;
        let scratch = table + ((table_len as u64 + 7) & !7);
        Layout { base, regs, saved_sp, saved_pc, table, scratch, top: scratch + SCRATCH_SIZE }
    }
}

#[derive(Debug)]
pub struct BuildReport {
    pub artifact: Artifact,
    /// Near trampoline address for each trap site.
    pub near: BTreeMap<u64, u64>,
    pub entry: u64,
    pub far: u64,
    pub layout: Layout,
}

pub struct Builder<'a> {
    codegen: &'a dyn CodeGen,
    near_sizes: HashMap<Option<u8>, u64>,
}

/// Reserve space near `target` and zero it so the space stops being free.
fn claim(pages: &mut PageStore, free: &mut FreeList, target: u64, size: u64) -> Result<u64> {
    let addr = free.reserve(target, size)?;
    pages.put(addr, Payload::Zero(size as usize))?;
    Ok(addr)
}

fn words(values: &[u64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes().to_vec()).collect()
}

impl<'a> Builder<'a> {
    pub fn new(codegen: &'a dyn CodeGen) -> Self {
        Builder { codegen, near_sizes: HashMap::new() }
    }

    fn near_size(&mut self, alt_rd: Option<u8>) -> Result<u64> {
        if let Some(size) = self.near_sizes.get(&alt_rd) {
            return Ok(*size);
        }
        let template = NearParams { far_pc: Some(0), alt_rd, ..NearParams::default() };
        let size = self.codegen.near(&template)?.len() as u64;
        self.near_sizes.insert(alt_rd, size);
        Ok(size)
    }

    fn place(pages: &mut PageStore, addr: u64, code: &[u8], reserved: u64) -> Result<()> {
        if code.len() as u64 > reserved {
            return Err(CkptError::tool(
                "code generator",
                format!("{} bytes generated for {:#x}, {} reserved", code.len(), addr, reserved),
            ));
        }
        pages.put(addr, Payload::Bytes(code))
    }

    /// Build the image for `events` on top of `pages` and write it as pass
    /// `pass` of the checkpoint. `verbose` asks the runtime to report every
    /// replayed return value.
    pub fn build(
        &mut self,
        ckpt: &Checkpoint,
        mut pages: PageStore,
        events: &[SysCall],
        verbose: bool,
        pass: u32,
    ) -> Result<BuildReport> {
        let mut regs = ckpt.reg_file()?;
        let sites = Checkpoint::trap_sites(events);
        for &addr in sites.keys() {
            pages.protect(addr, TRAP_WIDTH)
        }

        let mut free = pages.free_list();
        let mut near = BTreeMap::new();
        for (&addr, &alt_rd) in &sites {
            let size = self.near_size(alt_rd)?;
            let at = claim(&mut pages, &mut free, addr, size)?;
            debug!("Near trampoline for {:#x} at {:#x}", addr, at);
            near.insert(addr, at);
        }
        let entry_size = self.codegen.near(&NearParams::default())?.len() as u64;
        let entry = claim(&mut pages, &mut free, ckpt.entry_pc, entry_size)?;
        let far_size = self.codegen.far(0)?.len() as u64;
        let far = claim(&mut pages, &mut free, ckpt.entry_pc, far_size)?;

        let table = ReplayTable { entry_arg: regs[REG_ENTRY_ARG], events, assertions: &ckpt.stores, verbose };
        let table_len = table.encoded_len();
        let region_size = Layout::size_for(table_len);
        let layout = Layout::new(pages.reserve_page_aligned(region_size), table_len);
        debug!("Replay stack at {:#x}-{:#x}", layout.base, layout.top);

        for (&addr, &at) in &near {
            let trap = self.codegen.jump(displacement(addr, at))?;
            let params =
                NearParams { ret_pc: addr + TRAP_WIDTH, near_pc: at, buf: layout.scratch, far_pc: Some(far), alt_rd: sites[&addr] };
            let code = self.codegen.near(&params)?;
            Builder::place(&mut pages, addr, &trap, TRAP_WIDTH)?;
            Builder::place(&mut pages, at, &code, self.near_size(params.alt_rd)?)?;
        }

        let params = NearParams { ret_pc: ckpt.entry_pc, near_pc: entry, buf: layout.scratch, far_pc: None, alt_rd: None };
        Builder::place(&mut pages, entry, &self.codegen.near(&params)?, entry_size)?;
        Builder::place(&mut pages, far, &self.codegen.far(layout.base)?, far_size)?;

        let sp = regs[REG_SP];
        regs[REG_PC] = far;
        regs[REG_ENTRY_ARG] = entry;
        pages.put(layout.base, Payload::Zero(region_size as usize))?;
        pages.put(layout.regs, Payload::Bytes(&words(&regs)))?;
        pages.put(layout.saved_sp, Payload::Bytes(&layout.top.to_le_bytes()))?;
        pages.put(layout.saved_pc, Payload::Bytes(&layout.table.to_le_bytes()))?;
        pages.put(layout.table, Payload::Bytes(&table.encode()))?;
        pages.put(layout.scratch, Payload::Bytes(&sp.to_le_bytes()))?;

        let artifact = ckpt.artifact(pass);
        artifact.write(&pages.dump(), layout.regs)?;
        info!(
            "Checkpoint {} pass {}: {} trap site(s), {} event(s) -> {}",
            ckpt.index,
            pass,
            near.len(),
            events.len(),
            artifact.cfg.display()
        );

        Ok(BuildReport { artifact, near, entry, far, layout })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codegen::check_displacement;
    use crate::page_store::FIRST_PN;
    use crate::replay_table::{REPLAY_ENTRY, REPLAY_EXIT, REPLAY_RET};
    use std::path::Path;

    pub struct FakeCodeGen;

    impl CodeGen for FakeCodeGen {
        fn jump(&self, offset: i64) -> Result<Vec<u8>> {
            check_displacement(offset)?;
            Ok((offset as i32).to_le_bytes().to_vec())
        }
        fn near_body(&self, buf: u64, _far_pc: Option<u64>, alt_rd: Option<u8>) -> Result<Vec<u8>> {
            let mut code = buf.to_le_bytes().to_vec();
            code.resize(if alt_rd.is_some() { 28 } else { 24 }, 0x13);
            Ok(code)
        }
        fn far(&self, stack: u64) -> Result<Vec<u8>> {
            let mut code = stack.to_le_bytes().to_vec();
            code.resize(64, 0x73);
            Ok(code)
        }
    }

    pub fn checkpoint(dir: &Path) -> Checkpoint {
        let mut ckpt = Checkpoint::new(0, 0x10000, dir.join("ckpt0"));
        ckpt.regs = vec![0; NUM_REGS];
        ckpt.regs[REG_SP] = 0x7fff_0000;
        ckpt.regs[REG_ENTRY_ARG] = 0xa0a0;
        ckpt.pages.put(0x10000, Payload::Bytes(&[0x13])).unwrap();
        ckpt
    }

    pub fn word(store: &PageStore, addr: u64) -> u64 {
        let mut le = [0u8; 8];
        le.copy_from_slice(&store.read(addr, 8));
        u64::from_le_bytes(le)
    }

    pub fn reload(artifact: &Artifact) -> (PageStore, u64, String) {
        let (runs, data, regs) = artifact.load().unwrap();
        let cfg = std::fs::read_to_string(&artifact.cfg).unwrap();
        (PageStore::load(&runs, &data).unwrap(), regs, cfg)
    }

    #[test]
    fn minimal_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = checkpoint(dir.path());
        let report = Builder::new(&FakeCodeGen).build(&ckpt, ckpt.pages.snapshot(), &[], false, 1).unwrap();

        let (image, regs_addr, cfg) = reload(&report.artifact);
        let lines: Vec<&str> = cfg.lines().collect();
        assert!(lines[0].parse::<usize>().unwrap() >= 1);
        assert_eq!(u64::from_str_radix(lines.last().unwrap(), 16).unwrap(), regs_addr);
        assert_eq!(regs_addr, report.layout.regs);
        assert_eq!(report.layout.base % PAGE_SIZE as u64, 0);
        assert!(report.layout.base >= FIRST_PN * PAGE_SIZE as u64);

        assert_eq!(word(&image, regs_addr), report.far);
        assert_eq!(word(&image, regs_addr + 8 * REG_ENTRY_ARG as u64), report.entry);
        assert_eq!(word(&image, regs_addr + 8 * REG_SP as u64), 0x7fff_0000);
        assert_eq!(word(&image, report.layout.saved_sp), report.layout.top);
        assert_eq!(word(&image, report.layout.saved_pc), report.layout.table);
        assert_eq!(word(&image, report.layout.table), REPLAY_ENTRY);
        assert_eq!(word(&image, report.layout.table + 8), 0xa0a0);
        assert_eq!(word(&image, report.layout.scratch), 0x7fff_0000);
        assert_eq!(word(&image, report.far), report.layout.base);
        assert_eq!(image.read(0x10000, 1), vec![0x13]);
    }

    #[test]
    fn shared_syscall_site_gets_one_trampoline() {
        let dir = tempfile::tempdir().unwrap();
        let mut ckpt = checkpoint(dir.path());
        ckpt.pages.put(0x10040, Payload::Hex("00000073")).unwrap();
        let events = [SysCall::ret(0x10040, 1), SysCall::ret(0x10040, 2), SysCall::exit(0x10040)];
        let report = Builder::new(&FakeCodeGen).build(&ckpt, ckpt.pages.snapshot(), &events, false, 1).unwrap();

        assert_eq!(report.near.len(), 1);
        let near = report.near[&0x10040];
        let (image, _, _) = reload(&report.artifact);
        let trap = image.read(0x10040, 4);
        assert_eq!(trap, ((near as i64 - 0x10040) as i32).to_le_bytes().to_vec());
        assert_eq!(word(&image, near), report.layout.scratch);

        let table = report.layout.table;
        assert_eq!(word(&image, table + 16), REPLAY_RET);
        assert_eq!(word(&image, table + 24), 1);
        assert_eq!(word(&image, table + 48), REPLAY_EXIT);
    }

    #[test]
    fn trampolines_avoid_live_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut ckpt = checkpoint(dir.path());
        ckpt.pages.put(0x10000, Payload::Zero(0x100)).unwrap();
        ckpt.pages.put(0x10100, Payload::Hex("00000073")).unwrap();
        ckpt.pages.put(0x10104, Payload::Zero(0xefc)).unwrap();
        ckpt.pages.put(0x12000, Payload::Zero(4)).unwrap();
        let events = [SysCall::ret(0x10100, 0)];
        let report = Builder::new(&FakeCodeGen).build(&ckpt, ckpt.pages.snapshot(), &events, false, 1).unwrap();

        let near = report.near[&0x10100];
        assert!(near >= 0x11000 && near < 0x12000);
        assert!(report.entry >= 0x11000 && report.entry < 0x12000);
        assert!(report.far >= 0x11000 && report.far < 0x12000);
        assert_eq!(report.layout.base, 0x13000);
    }

    #[test]
    fn full_memory_is_an_allocation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut ckpt = checkpoint(dir.path());
        ckpt.pages.put(0x10000, Payload::Zero(PAGE_SIZE)).unwrap();
        match Builder::new(&FakeCodeGen).build(&ckpt, ckpt.pages.snapshot(), &[], false, 1) {
            Err(CkptError::AllocationFailure { target: 0x10000, .. }) => (),
            other => panic!("Unexpected result {:?}", other.map(|r| r.entry)),
        }
        assert!(!ckpt.artifact(1).exists());
    }

    #[test]
    fn distant_free_space_overflows_the_jump() {
        let dir = tempfile::tempdir().unwrap();
        let mut ckpt = checkpoint(dir.path());
        ckpt.pages.put(0x10000, Payload::Zero(0x200000)).unwrap();
        ckpt.pages.put(0x300000, Payload::Zero(1)).unwrap();
        match Builder::new(&FakeCodeGen).build(&ckpt, ckpt.pages.snapshot(), &[], false, 1) {
            Err(CkptError::EncodingOverflow { .. }) => (),
            other => panic!("Unexpected result {:?}", other.map(|r| r.entry)),
        }
        assert!(!ckpt.artifact(1).exists());
    }

    #[test]
    fn building_leaves_the_source_image_alone() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = checkpoint(dir.path());
        let before = ckpt.pages.free_list();
        Builder::new(&FakeCodeGen).build(&ckpt, ckpt.pages.snapshot(), &[], true, 1).unwrap();
        assert_eq!(ckpt.pages.free_list(), before);
    }
}
