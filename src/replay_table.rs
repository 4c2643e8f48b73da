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

use std::fmt;

pub const REPLAY_RET: u64 = 0;
pub const REPLAY_EXIT: u64 = 1;
pub const REPLAY_ENTRY: u64 = 2;
pub const REPLAY_RET_VERBOSE: u64 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Return(u64),
    Exit,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemWrite {
    pub addr: u64,
    pub data: Vec<u8>,
}

/// One observed system call or breakpoint hit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SysCall {
    pub addr: u64,
    pub action: Action,
    pub write: Option<MemWrite>,
    /// Register that receives the value instead of the default return
    /// register.
    pub alt_rd: Option<u8>,
}

impl SysCall {
    pub fn ret(addr: u64, value: u64) -> Self {
        SysCall { addr, action: Action::Return(value), write: None, alt_rd: None }
    }

    pub fn exit(addr: u64) -> Self {
        SysCall { addr, action: Action::Exit, write: None, alt_rd: None }
    }

    pub fn retval(&self) -> Option<u64> {
        match self.action {
            Action::Return(value) => Some(value),
            Action::Exit => None,
        }
    }
}

impl fmt::Display for SysCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.action {
            Action::Return(value) => write!(f, "{:#x} -> {:#x}", self.addr, value)?,
            Action::Exit => write!(f, "{:#x} -> exit", self.addr)?,
        }
        if let Some(write) = &self.write {
            write!(f, " [{} bytes at {:#x}]", write.data.len(), write.addr)?;
        }
        if let Some(rd) = self.alt_rd {
            write!(f, " (x{})", rd)?;
        }
        Ok(())
    }
}

/// Memory the runtime checks, not restores, when the checkpoint exits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreAssertion {
    pub addr: u64,
    /// Width in bytes: 1, 2, 4 or 8.
    pub size: u64,
    pub value: u64,
}

pub struct ReplayTable<'a> {
    pub entry_arg: u64,
    pub events: &'a [SysCall],
    pub assertions: &'a [StoreAssertion],
    /// Report returned values instead of resuming silently.
    pub verbose: bool,
}

fn push_word(buf: &mut Vec<u8>, word: u64) {
    buf.extend_from_slice(&word.to_le_bytes())
}

impl<'a> ReplayTable<'a> {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        push_word(&mut buf, REPLAY_ENTRY);
        push_word(&mut buf, self.entry_arg);

        for event in self.events {
            if let Some(write) = &event.write {
                push_word(&mut buf, write.addr);
                push_word(&mut buf, write.data.len() as u64);
                buf.extend_from_slice(&write.data);
                buf.resize(buf.len() + padding(write.data.len()), 0);
            }
            match event.action {
                Action::Return(value) => {
                    push_word(&mut buf, if self.verbose { REPLAY_RET_VERBOSE } else { REPLAY_RET });
                    push_word(&mut buf, value)
                }
                Action::Exit => {
                    push_word(&mut buf, REPLAY_EXIT);
                    push_word(&mut buf, 0)
                }
            }
        }

        for assertion in self.assertions {
            push_word(&mut buf, assertion.addr);
            push_word(&mut buf, assertion.size);
            push_word(&mut buf, assertion.value)
        }

        push_word(&mut buf, 0);
        push_word(&mut buf, 0);
        buf
    }

    pub fn encoded_len(&self) -> usize {
        let events: usize = self
            .events
            .iter()
            .map(|event| 16 + event.write.as_ref().map_or(0, |w| 16 + w.data.len() + padding(w.data.len())))
            .sum();
        16 + events + 24 * self.assertions.len() + 16
    }
}

fn padding(len: usize) -> usize {
    ((len + 7) & !7) - len
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Decoded {
        entry_arg: u64,
        verbose: bool,
        events: Vec<SysCall>,
        assertions: Vec<StoreAssertion>,
    }

    fn word(buf: &[u8], pos: &mut usize) -> u64 {
        let mut le = [0u8; 8];
        le.copy_from_slice(&buf[*pos..*pos + 8]);
        *pos += 8;
        u64::from_le_bytes(le)
    }

    // Mirrors the runtime's parser: assertions only follow an exit record.
    fn decode(buf: &[u8]) -> Decoded {
        let mut pos = 0;
        assert_eq!(word(buf, &mut pos), REPLAY_ENTRY);
        let entry_arg = word(buf, &mut pos);
        let mut decoded = Decoded { entry_arg, verbose: false, events: vec![], assertions: vec![] };
        let mut pending_write = None;
        loop {
            let head = word(buf, &mut pos);
            let value = word(buf, &mut pos);
            match head {
                REPLAY_RET if value == 0 && pending_write.is_none() && pos == buf.len() => break,
                REPLAY_RET | REPLAY_RET_VERBOSE => {
                    decoded.verbose = head == REPLAY_RET_VERBOSE;
                    let mut event = SysCall::ret(0, value);
                    event.write = pending_write.take();
                    decoded.events.push(event)
                }
                REPLAY_EXIT => {
                    let mut event = SysCall::exit(0);
                    event.write = pending_write.take();
                    decoded.events.push(event);
                    loop {
                        let addr = word(buf, &mut pos);
                        let size = word(buf, &mut pos);
                        if addr == 0 {
                            assert_eq!(size, 0);
                            assert_eq!(pos, buf.len());
                            return decoded;
                        }
                        let value = word(buf, &mut pos);
                        decoded.assertions.push(StoreAssertion { addr, size, value })
                    }
                }
                addr => {
                    let len = value as usize;
                    let data = buf[pos..pos + len].to_vec();
                    assert!(buf[pos + len..pos + len + padding(len)].iter().all(|b| *b == 0));
                    pos += len + padding(len);
                    pending_write = Some(MemWrite { addr, data })
                }
            }
        }
        decoded
    }

    fn strip_addrs(events: &[SysCall]) -> Vec<SysCall> {
        events.iter().cloned().map(|e| SysCall { addr: 0, alt_rd: None, ..e }).collect()
    }

    #[test]
    fn empty_table() {
        let table = ReplayTable { entry_arg: 0x1234, events: &[], assertions: &[], verbose: false };
        let buf = table.encode();
        assert_eq!(buf.len(), 32);
        assert_eq!(buf.len(), table.encoded_len());
        assert_eq!(&buf[..8], &REPLAY_ENTRY.to_le_bytes());
        assert_eq!(&buf[8..16], &0x1234u64.to_le_bytes());
        assert!(buf[16..].iter().all(|b| *b == 0));
    }

    #[test]
    fn write_payload_is_padded() {
        let mut event = SysCall::ret(0x10078, 5);
        event.write = Some(MemWrite { addr: 0x20000, data: b"hello".to_vec() });
        let events = [event];
        let table = ReplayTable { entry_arg: 0, events: &events, assertions: &[], verbose: false };
        let buf = table.encode();
        assert_eq!(buf.len(), table.encoded_len());
        assert_eq!(&buf[16..24], &0x20000u64.to_le_bytes());
        assert_eq!(&buf[24..32], &5u64.to_le_bytes());
        assert_eq!(&buf[32..40], b"hello\0\0\0");
        assert_eq!(&buf[40..48], &REPLAY_RET.to_le_bytes());
        assert_eq!(&buf[48..56], &5u64.to_le_bytes());
    }

    #[test]
    fn verbose_tags_returns_only() {
        let events = [SysCall::ret(0x100, 7), SysCall::exit(0x200)];
        let buf = ReplayTable { entry_arg: 0, events: &events, assertions: &[], verbose: true }.encode();
        assert_eq!(&buf[16..24], &REPLAY_RET_VERBOSE.to_le_bytes());
        assert_eq!(&buf[32..40], &REPLAY_EXIT.to_le_bytes());
        assert_eq!(&buf[40..48], &[0; 8]);
    }

    #[test]
    fn decoding_recovers_events_and_assertions() {
        let mut with_write = SysCall::ret(0x10078, 0xfffffffffffffff2);
        with_write.write = Some(MemWrite { addr: 0x7fff_0000, data: (0u8..13).collect() });
        let mut aligned_write = SysCall::exit(0x100a0);
        aligned_write.write = Some(MemWrite { addr: 0x7fff_1000, data: vec![0xaa; 16] });
        let events = vec![SysCall::ret(0x10040, 3), with_write, SysCall::ret(0x10040, 0), aligned_write];
        let assertions = vec![
            StoreAssertion { addr: 0x30000, size: 4, value: 0xdeadbeef },
            StoreAssertion { addr: 0x30008, size: 1, value: 0x7f },
        ];
        let table = ReplayTable { entry_arg: 42, events: &events, assertions: &assertions, verbose: false };
        let buf = table.encode();
        assert_eq!(buf.len(), table.encoded_len());
        assert_eq!(buf.len() % 8, 0);

        let decoded = decode(&buf);
        assert_eq!(decoded.entry_arg, 42);
        assert!(!decoded.verbose);
        assert_eq!(decoded.events, strip_addrs(&events));
        assert_eq!(decoded.assertions, assertions);
    }

    #[test]
    fn encoding_is_deterministic() {
        let events = [SysCall::ret(0x100, 1), SysCall::exit(0x104)];
        let a = ReplayTable { entry_arg: 9, events: &events, assertions: &[], verbose: false }.encode();
        let b = ReplayTable { entry_arg: 9, events: &events, assertions: &[], verbose: false }.encode();
        assert_eq!(a, b);
    }
}
