//! External memory collaborator.
//!
//! A flat little-endian byte array mapped at address 0. Each channel holds
//! one outstanding request: the port is busy from the accepting tick until
//! its response is consumed. Loads return the aligned word containing the
//! address; stores update only the lanes enabled by their mask. A request
//! that is misaligned for its size, or that falls past the end of the array,
//! completes with `error` set and no side effect.

use serde::{Deserialize, Serialize};
use soc_core::bus::{
    Access, BusRequest, BusResponse, BusTarget, ByteMask, Channel, ResponseSlot, TargetPort,
};
use soc_core::logging::{log, LogCategory, LogLevel};

use crate::SocError;

/// State changes decided during one tick, applied by [`Memory::commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryCommit {
    slots: [ResponseSlot; 2],
    write: Option<(usize, u32, ByteMask)>,
}

/// Per-channel response registers, saved with the system state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemoryPorts {
    pub slots: [ResponseSlot; 2],
}

pub struct Memory {
    data: Vec<u8>,
    latency: u32,
    ports: MemoryPorts,
    loaded: bool,
}

impl Memory {
    pub fn new(size: usize, latency: u32) -> Self {
        Self {
            data: vec![0; size],
            latency,
            ports: MemoryPorts::default(),
            loaded: false,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Copy `image` to address 0. The rest of memory is cleared.
    pub fn load_image(&mut self, image: &[u8]) -> Result<(), SocError> {
        if image.len() > self.data.len() {
            return Err(SocError::ImageTooLarge {
                len: image.len(),
                capacity: self.data.len(),
            });
        }
        self.data.fill(0);
        self.data[..image.len()].copy_from_slice(image);
        self.loaded = true;
        log(LogCategory::Memory, LogLevel::Info, || {
            format!("MEM: loaded {} byte image", image.len())
        });
        Ok(())
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
        self.loaded = false;
    }

    /// Drop outstanding requests; contents are kept
    pub fn reset(&mut self) {
        self.ports = MemoryPorts::default();
    }

    pub fn ports(&self) -> MemoryPorts {
        self.ports
    }

    pub fn set_ports(&mut self, ports: MemoryPorts) {
        self.ports = ports;
    }

    fn word_index(&self, addr: u32) -> Option<usize> {
        let base = (addr & !3) as usize;
        (base + 4 <= self.data.len()).then_some(base)
    }

    /// Aligned word containing `addr`, if it is in range
    pub fn read_word(&self, addr: u32) -> Option<u32> {
        self.word_index(addr).map(|i| {
            u32::from_le_bytes([self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]])
        })
    }

    /// Direct write for host-side setup; not a bus access
    pub fn write_word(&mut self, addr: u32, value: u32) -> bool {
        match self.word_index(addr) {
            Some(i) => {
                self.data[i..i + 4].copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    fn execute(&self, req: &BusRequest) -> (BusResponse, Option<(usize, u32, ByteMask)>) {
        let tag = req.tag();
        let index = self.word_index(req.addr);
        let Some(index) = index.filter(|_| req.size.is_aligned(req.addr)) else {
            log(LogCategory::Memory, LogLevel::Warn, || {
                format!(
                    "MEM: bad {:?} access at {:08X} ({:?})",
                    req.channel(),
                    req.addr,
                    req.size
                )
            });
            return (BusResponse::error(tag), None);
        };

        match req.access {
            Access::Load { tag } => {
                let word = self.read_word(req.addr).unwrap_or(0);
                (BusResponse::ok(tag, word), None)
            }
            Access::Store { data, mask } => (BusResponse::ok(0, 0), Some((index, data, mask))),
        }
    }

    /// Decide this tick from the router's port signals without touching the array.
    pub fn step(&self, port: &TargetPort) -> MemoryCommit {
        let mut commit = MemoryCommit {
            slots: self.ports.slots,
            write: None,
        };
        for channel in Channel::ALL {
            let ch = channel.index();
            let accepted = port.request(channel).map(|req| {
                let (response, write) = self.execute(req);
                if write.is_some() {
                    commit.write = write;
                }
                response
            });
            commit.slots[ch] =
                self.ports.slots[ch].next(accepted, self.latency, port.consumed(channel));
        }
        commit
    }

    pub fn commit(&mut self, commit: MemoryCommit) {
        self.ports.slots = commit.slots;
        if let Some((index, data, mask)) = commit.write {
            let old = u32::from_le_bytes([
                self.data[index],
                self.data[index + 1],
                self.data[index + 2],
                self.data[index + 3],
            ]);
            let merged = mask.merge(old, data);
            self.data[index..index + 4].copy_from_slice(&merged.to_le_bytes());
        }
    }
}

impl BusTarget for Memory {
    fn ready(&self, channel: Channel) -> bool {
        !self.ports.slots[channel.index()].is_busy()
    }

    fn response(&self, channel: Channel) -> Option<BusResponse> {
        self.ports.slots[channel.index()].visible()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soc_core::bus::AccessSize;

    fn tick(mem: &mut Memory, port: TargetPort) {
        let c = mem.step(&port);
        mem.commit(c);
    }

    fn load_port(addr: u32, size: AccessSize, tag: u16) -> TargetPort {
        TargetPort {
            load: Some(BusRequest::load(addr, size, tag)),
            ..Default::default()
        }
    }

    #[test]
    fn test_load_image_and_read() {
        let mut mem = Memory::new(64, 2);
        mem.load_image(&[0x78, 0x56, 0x34, 0x12, 0xEF]).unwrap();
        assert!(mem.is_loaded());
        assert_eq!(mem.read_word(0), Some(0x1234_5678));
        assert_eq!(mem.read_word(5), Some(0x0000_00EF));
        assert_eq!(mem.read_word(64), None);
    }

    #[test]
    fn test_image_too_large() {
        let mut mem = Memory::new(4, 1);
        let err = mem.load_image(&[0; 5]).unwrap_err();
        assert!(matches!(err, SocError::ImageTooLarge { len: 5, capacity: 4 }));
    }

    #[test]
    fn test_load_latency_two() {
        let mut mem = Memory::new(64, 2);
        mem.write_word(8, 0xCAFE_F00D);
        tick(&mut mem, load_port(8, AccessSize::Word, 3));
        assert!(!mem.ready(Channel::Load));
        assert_eq!(mem.response(Channel::Load), None);

        tick(&mut mem, TargetPort::default());
        assert_eq!(mem.response(Channel::Load), Some(BusResponse::ok(3, 0xCAFE_F00D)));

        // held until consumed
        tick(&mut mem, TargetPort::default());
        assert!(mem.response(Channel::Load).is_some());
        tick(
            &mut mem,
            TargetPort {
                load_consumed: true,
                ..Default::default()
            },
        );
        assert!(mem.ready(Channel::Load));
        assert_eq!(mem.response(Channel::Load), None);
    }

    #[test]
    fn test_store_mask_merges_lanes() {
        let mut mem = Memory::new(64, 1);
        mem.write_word(0x10, 0xAABB_CCDD);
        tick(
            &mut mem,
            TargetPort {
                store: Some(BusRequest::store(
                    0x12,
                    AccessSize::Half,
                    0x1122_0000,
                    ByteMask::new(0b1100),
                )),
                ..Default::default()
            },
        );
        assert_eq!(mem.read_word(0x10), Some(0x1122_CCDD));
        assert_eq!(mem.response(Channel::Store), Some(BusResponse::ok(0, 0)));
    }

    #[test]
    fn test_byte_load_returns_aligned_word() {
        let mut mem = Memory::new(64, 1);
        mem.write_word(0x20, 0x4433_2211);
        tick(&mut mem, load_port(0x23, AccessSize::Byte, 1));
        assert_eq!(mem.response(Channel::Load).map(|r| r.data), Some(0x4433_2211));
    }

    #[test]
    fn test_misaligned_word_is_error() {
        let mut mem = Memory::new(64, 1);
        tick(&mut mem, load_port(0x22, AccessSize::Word, 4));
        assert_eq!(mem.response(Channel::Load), Some(BusResponse::error(4)));
    }

    #[test]
    fn test_out_of_range_store_is_error_without_write() {
        let mut mem = Memory::new(16, 1);
        tick(
            &mut mem,
            TargetPort {
                store: Some(BusRequest::store_word(0x10, 0xFFFF_FFFF)),
                ..Default::default()
            },
        );
        let resp = mem.response(Channel::Store).unwrap();
        assert!(resp.error);
        assert_eq!(mem.read_word(0xC), Some(0));
    }

    #[test]
    fn test_channels_independent() {
        let mut mem = Memory::new(64, 1);
        tick(&mut mem, load_port(0, AccessSize::Word, 0));
        assert!(!mem.ready(Channel::Load));
        assert!(mem.ready(Channel::Store));
    }

    #[test]
    fn test_step_does_not_write_before_commit() {
        let mut mem = Memory::new(16, 1);
        let c = mem.step(&TargetPort {
            store: Some(BusRequest::store_word(0, 7)),
            ..Default::default()
        });
        assert_eq!(mem.read_word(0), Some(0));
        mem.commit(c);
        assert_eq!(mem.read_word(0), Some(7));
    }

    #[test]
    fn test_reset_keeps_contents() {
        let mut mem = Memory::new(16, 3);
        mem.write_word(4, 99);
        tick(&mut mem, load_port(4, AccessSize::Word, 0));
        mem.reset();
        assert!(mem.ready(Channel::Load));
        assert_eq!(mem.read_word(4), Some(99));
    }
}
