//! Fixtures shared by the unit tests
use alloc::{sync::Arc, vec::Vec};
use clk_tree::{ClockTree, ClockTreeConfig};
use core::sync::atomic::{AtomicUsize, Ordering};

const FDT_MAGIC: u32 = 0xd00d_feed;
const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_END: u32 = 9;
const HEADER_SIZE: usize = 40;
// One terminating entry
const RSVMAP_SIZE: usize = 16;

fn thread_actor() -> usize {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    std::thread_local! {
        static ACTOR: usize = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ACTOR.with(|actor| *actor)
}

pub(crate) fn test_tree() -> Arc<ClockTree> {
    ClockTree::new(ClockTreeConfig::default(), thread_actor)
}

/// Assembles a version 17 flattened device tree in memory
#[derive(Default)]
pub(crate) struct DtbBuilder {
    structure: Vec<u8>,
    strings: Vec<u8>,
}

impl DtbBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn token(&mut self, token: u32) {
        self.structure.extend_from_slice(&token.to_be_bytes());
    }

    fn pad(&mut self) {
        while self.structure.len() % 4 != 0 {
            self.structure.push(0);
        }
    }

    pub(crate) fn begin(&mut self, name: &str) {
        self.token(FDT_BEGIN_NODE);
        self.structure.extend_from_slice(name.as_bytes());
        self.structure.push(0);
        self.pad();
    }

    pub(crate) fn end(&mut self) {
        self.token(FDT_END_NODE);
    }

    pub(crate) fn prop(&mut self, name: &str, value: &[u8]) {
        let offset = u32::try_from(self.strings.len()).unwrap();
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);

        self.token(FDT_PROP);
        self.token(u32::try_from(value.len()).unwrap());
        self.token(offset);
        self.structure.extend_from_slice(value);
        self.pad();
    }

    pub(crate) fn prop_u32s(&mut self, name: &str, values: &[u32]) {
        let value: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
        self.prop(name, &value);
    }

    pub(crate) fn prop_str(&mut self, name: &str, value: &str) {
        self.prop_strs(name, &[value]);
    }

    pub(crate) fn prop_strs(&mut self, name: &str, values: &[&str]) {
        let mut value = Vec::new();
        for s in values {
            value.extend_from_slice(s.as_bytes());
            value.push(0);
        }
        self.prop(name, &value);
    }

    pub(crate) fn finish(mut self) -> Vec<u8> {
        self.token(FDT_END);

        let off_struct = HEADER_SIZE + RSVMAP_SIZE;
        let off_strings = off_struct + self.structure.len();
        let total = off_strings + self.strings.len();
        let len = |n: usize| u32::try_from(n).unwrap();
        let header = [
            FDT_MAGIC,
            len(total),
            len(off_struct),
            len(off_strings),
            len(HEADER_SIZE),
            // version, last compatible version
            17,
            16,
            // boot cpu
            0,
            len(self.strings.len()),
            len(self.structure.len()),
        ];

        let mut blob = Vec::with_capacity(total);
        for field in header {
            blob.extend_from_slice(&field.to_be_bytes());
        }
        blob.resize(off_struct, 0);
        blob.extend_from_slice(&self.structure);
        blob.extend_from_slice(&self.strings);
        blob
    }
}
