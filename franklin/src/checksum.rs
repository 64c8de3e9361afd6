//! Per-group parity codes protecting every packet on the link
//!
//! Each group of three frame bytes is protected by one check byte. The low three bits of the
//! check byte carry the group's sequence tag, the upper five bits are parity bits. Parity bit `i`
//! makes equation `i` even, where the equation covers the data bits selected by `MASKS[i]`.
//!
//! Every data bit has a distinct syndrome of at least two equations, so a single flipped bit can
//! be located. Receivers only use this for detection and ask for a retransmission.

/// Number of frame bytes protected by a single check byte
pub const GROUP_SIZE: usize = 3;

const TAG_MASK: u8 = 0x07;
const PARITY_SHIFT: u32 = 3;

// Row `i` selects the bits of data byte 0, 1, 2 and the tag bits covered by parity bit `i`.
const MASKS: [[u8; 4]; 5] = [
    [0x5b, 0xad, 0xaa, 0x06],
    [0x6d, 0x36, 0x33, 0x07],
    [0x8e, 0xc7, 0xc3, 0x07],
    [0xf0, 0x07, 0xfc, 0x03],
    [0x00, 0xf8, 0xff, 0x03],
];

fn parity(group: &[u8; GROUP_SIZE], tag: u8, mask: &[u8; 4]) -> u8 {
    let folded = (group[0] & mask[0]) ^ (group[1] & mask[1]) ^ (group[2] & mask[2]) ^ (tag & mask[3]);
    (folded.count_ones() & 1) as u8
}

/// Computes the check byte for group `tag` holding `group`
pub fn compute(tag: u8, group: &[u8; GROUP_SIZE]) -> u8 {
    let tag = tag & TAG_MASK;
    MASKS
        .iter()
        .enumerate()
        .fold(tag, |check, (i, mask)| {
            check | parity(group, tag, mask) << (PARITY_SHIFT + i as u32)
        })
}

/// Returns the parity equations violated by `check`, one bit per equation
///
/// Zero means the group is intact. A non-zero syndrome with two or more bits identifies a single
/// flipped data bit.
pub fn syndrome(tag: u8, group: &[u8; GROUP_SIZE], check: u8) -> u8 {
    let tag = tag & TAG_MASK;
    MASKS.iter().enumerate().fold(0, |syndrome, (i, mask)| {
        let stored = (check >> (PARITY_SHIFT + i as u32)) & 1;
        syndrome | (stored ^ parity(group, tag, mask)) << i
    })
}

/// Validates a received check byte against its group
pub fn validate(tag: u8, group: &[u8; GROUP_SIZE], check: u8) -> bool {
    check & TAG_MASK == tag & TAG_MASK && syndrome(tag, group, check) == 0
}

/// Number of check bytes following a frame of `len` bytes
pub const fn checksum_len(len: usize) -> usize {
    (len + GROUP_SIZE - 1) / GROUP_SIZE
}

/// Returns group `index` of `frame`, zero padded past the end
pub fn group(frame: &[u8], index: usize) -> [u8; GROUP_SIZE] {
    let mut group = [0u8; GROUP_SIZE];
    let start = index * GROUP_SIZE;
    if start < frame.len() {
        let end = (start + GROUP_SIZE).min(frame.len());
        group[..end - start].copy_from_slice(&frame[start..end]);
    }
    group
}
