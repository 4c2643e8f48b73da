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
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::debug;
use sha2::{Digest, Sha256};

use crate::error::{CkptError, Result};

/// Reach of a single `jal`: even offsets in `[-JUMP_RANGE, JUMP_RANGE)`.
pub const JUMP_RANGE: i64 = 1 << 20;

pub fn check_displacement(offset: i64) -> Result<()> {
    if offset % 2 != 0 || offset < -JUMP_RANGE || offset >= JUMP_RANGE {
        Err(CkptError::EncodingOverflow { offset })
    } else {
        Ok(())
    }
}

pub fn displacement(from: u64, to: u64) -> i64 {
    to.wrapping_sub(from) as i64
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NearParams {
    /// Where execution continues after the trampoline.
    pub ret_pc: u64,
    /// Address the trampoline is placed at.
    pub near_pc: u64,
    /// Scratch buffer for the trampoline's temporaries.
    pub buf: u64,
    /// Far trampoline to call through; absent for the entry trampoline.
    pub far_pc: Option<u64>,
    pub alt_rd: Option<u8>,
}

pub trait CodeGen {
    /// A single unconditional pc-relative jump.
    fn jump(&self, offset: i64) -> Result<Vec<u8>>;

    fn near_body(&self, buf: u64, far_pc: Option<u64>, alt_rd: Option<u8>) -> Result<Vec<u8>>;

    /// The dispatcher that walks the replay table, given the replay-stack base.
    fn far(&self, stack: u64) -> Result<Vec<u8>>;

    /// A near trampoline followed by its jump back to `ret_pc`.
    fn near(&self, params: &NearParams) -> Result<Vec<u8>> {
        let mut code = self.near_body(params.buf, params.far_pc, params.alt_rd)?;
        let from = params.near_pc + code.len() as u64;
        let back = self.jump(displacement(from, params.ret_pc))?;
        code.extend_from_slice(&back);
        Ok(code)
    }
}

/// Hands out code generators whose build products cannot collide with those
/// of other checkpoints built at the same time.
pub trait Toolchain: Sync {
    fn session(&self, name: &Path) -> Result<Box<dyn CodeGen>>;
}

pub struct MakeToolchain {
    dir: PathBuf,
}

impl MakeToolchain {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        MakeToolchain { dir: dir.into() }
    }
}

fn build_dir(name: &Path) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.input(name.to_string_lossy().as_bytes());
    hasher.input(&std::process::id().to_le_bytes());
    let digest: String = hasher.result().iter().take(8).map(|b| format!("{:02x}", b)).collect();
    std::env::temp_dir().join(format!("ckpt-{}", digest))
}

impl Toolchain for MakeToolchain {
    fn session(&self, name: &Path) -> Result<Box<dyn CodeGen>> {
        let build_dir = build_dir(name);
        fs::create_dir_all(&build_dir)?;
        debug!("Trampolines for {} build in {}", name.display(), build_dir.display());
        Ok(Box::new(MakeCodeGen { dir: self.dir.clone(), build_dir }))
    }
}

pub struct MakeCodeGen {
    dir: PathBuf,
    build_dir: PathBuf,
}

impl MakeCodeGen {
    fn make(&self, target: &str, vars: &[(&str, String)]) -> Result<Vec<u8>> {
        let out = self.build_dir.join(target);
        match fs::remove_file(&out) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
            _ => (),
        }

        let mut cmd = Command::new("make");
        cmd.arg("-s").arg("-C").arg(&self.dir).arg(format!("BUILD={}", self.build_dir.display())).arg(&out);
        for (var, value) in vars {
            cmd.arg(format!("{}={}", var, value));
        }
        cmd.arg("NORVC=1");
        let status = cmd
            .stdout(Stdio::null())
            .status()
            .map_err(|err| CkptError::tool("make", format!("failed to run: {}", err)))?;

        if !status.success() {
            return Err(CkptError::tool(format!("make {}", target), status));
        }
        Ok(fs::read(&out)?)
    }
}

impl CodeGen for MakeCodeGen {
    fn jump(&self, offset: i64) -> Result<Vec<u8>> {
        check_displacement(offset)?;
        self.make("jump.bin", &[("OFFSET", offset.to_string())])
    }

    fn near_body(&self, buf: u64, far_pc: Option<u64>, alt_rd: Option<u8>) -> Result<Vec<u8>> {
        let mut vars = vec![("NEAR_BUF", buf.to_string())];
        if let Some(far_pc) = far_pc {
            vars.push(("FAR_CALL", far_pc.to_string()));
        }
        if let Some(rd) = alt_rd {
            vars.push(("RD", rd.to_string()));
        }
        self.make("near.bin", &vars)
    }

    fn far(&self, stack: u64) -> Result<Vec<u8>> {
        self.make("far.bin", &[("FAR_STACK", stack.to_string())])
    }
}

impl Drop for MakeCodeGen {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.build_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jal_range() {
        assert!(check_displacement(0).is_ok());
        assert!(check_displacement(-JUMP_RANGE).is_ok());
        assert!(check_displacement(JUMP_RANGE - 2).is_ok());
        assert!(check_displacement(JUMP_RANGE).is_err());
        assert!(check_displacement(-JUMP_RANGE - 2).is_err());
        assert!(check_displacement(3).is_err());
    }

    #[test]
    fn displacement_is_signed() {
        assert_eq!(displacement(0x10010, 0x10000), -0x10);
        assert_eq!(displacement(0x10000, 0x10010), 0x10);
    }

    struct Fixed;

    impl CodeGen for Fixed {
        fn jump(&self, offset: i64) -> Result<Vec<u8>> {
            check_displacement(offset)?;
            Ok((offset as i32).to_le_bytes().to_vec())
        }
        fn near_body(&self, _buf: u64, _far_pc: Option<u64>, _alt_rd: Option<u8>) -> Result<Vec<u8>> {
            Ok(vec![0x13, 0, 0, 0])
        }
        fn far(&self, _stack: u64) -> Result<Vec<u8>> {
            Ok(vec![])
        }
    }

    #[test]
    fn near_jumps_back_from_its_end() {
        let params = NearParams { ret_pc: 0x10004, near_pc: 0x10100, ..NearParams::default() };
        let code = Fixed.near(&params).unwrap();
        assert_eq!(code.len(), 8);
        assert_eq!(&code[4..], &(-0x100i32).to_le_bytes());
    }

    #[test]
    fn near_too_far_overflows() {
        let params = NearParams { ret_pc: 0, near_pc: 0x200000, ..NearParams::default() };
        match Fixed.near(&params) {
            Err(CkptError::EncodingOverflow { .. }) => (),
            other => panic!("Unexpected result {:?}", other.map(|c| c.len())),
        }
    }

    #[cfg(unix)]
    fn make_toolchain(dir: &Path) -> MakeToolchain {
        let makefile = "\
$(BUILD)/jump.bin:
\tprintf 'J:$(OFFSET):$(NORVC)' > $@
$(BUILD)/near.bin:
\tprintf 'N:$(NEAR_BUF):$(FAR_CALL):$(RD)' > $@
$(BUILD)/far.bin:
\texit 2
";
        fs::write(dir.join("Makefile"), makefile).unwrap();
        MakeToolchain::new(dir)
    }

    #[cfg(unix)]
    #[test]
    fn make_passes_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().join("params");
        let codegen = make_toolchain(dir.path()).session(&name).unwrap();
        assert!(build_dir(&name).is_dir());

        assert_eq!(codegen.jump(8).unwrap(), b"J:8:1".to_vec());
        assert_eq!(codegen.jump(-4).unwrap(), b"J:-4:1".to_vec());
        assert_eq!(codegen.near_body(64, None, None).unwrap(), b"N:64::".to_vec());
        assert_eq!(codegen.near_body(64, Some(0x100), Some(15)).unwrap(), b"N:64:256:15".to_vec());

        drop(codegen);
        assert!(!build_dir(&name).exists());
    }

    #[cfg(unix)]
    #[test]
    fn failing_make_is_a_tool_failure() {
        let dir = tempfile::tempdir().unwrap();
        let codegen = make_toolchain(dir.path()).session(&dir.path().join("fails")).unwrap();
        match codegen.far(0x30000) {
            Err(CkptError::ExternalToolFailure { tool, status }) => {
                assert_eq!(tool, "make far.bin");
                assert!(status.contains('2'), "status {}", status)
            }
            other => panic!("Unexpected result {:?}", other),
        }
        match codegen.jump(JUMP_RANGE) {
            Err(CkptError::EncodingOverflow { .. }) => (),
            other => panic!("Unexpected result {:?}", other),
        }
    }
}
