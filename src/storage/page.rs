//! Binary page layouts: the ordinary page's free-space-offset header, and
//! page one's validity marker pair, specialized to this engine's fixed
//! 8 KiB pages and page-1-is-special convention.

use rand::RngCore;

use crate::common::{bytes_to_u16, u16_to_bytes, PAGE_SIZE};

/// Page number 1 is reserved for the validity marker.
pub const PAGE_ONE: u32 = 1;

pub const VC_OPEN_OFFSET: usize = 100;
pub const VC_CLOSE_OFFSET: usize = 108;
pub const VC_LEN: usize = 8;

/// Builds a fresh all-zero ordinary page with FSO = 2 (payload starts right
/// after the 2-byte header).
pub fn new_ordinary_raw() -> Vec<u8> {
    let mut data = vec![0u8; PAGE_SIZE];
    set_fso(&mut data, 2);
    data
}

pub fn fso(data: &[u8]) -> u16 {
    bytes_to_u16(&data[0..2])
}

pub fn set_fso(data: &mut [u8], value: u16) {
    data[0..2].copy_from_slice(&u16_to_bytes(value));
}

pub fn free_space(data: &[u8]) -> u16 {
    PAGE_SIZE as u16 - fso(data)
}

/// Appends `raw` at the current FSO, advances FSO, and returns the offset the
/// bytes were written at.
pub fn insert(data: &mut [u8], raw: &[u8]) -> u16 {
    let offset = fso(data);
    let start = offset as usize;
    data[start..start + raw.len()].copy_from_slice(raw);
    set_fso(data, offset + raw.len() as u16);
    offset
}

/// Recovery helper: rewrites `raw` at `offset`, raising FSO only if the
/// write extends past the current free-space offset.
pub fn recover_insert(data: &mut [u8], offset: u16, raw: &[u8]) {
    let start = offset as usize;
    data[start..start + raw.len()].copy_from_slice(raw);
    let end = offset + raw.len() as u16;
    if end > fso(data) {
        set_fso(data, end);
    }
}

/// Recovery helper: rewrites `raw` at `offset` in place (the slot already
/// exists, so FSO is never adjusted).
pub fn recover_update(data: &mut [u8], offset: u16, raw: &[u8]) {
    let start = offset as usize;
    data[start..start + raw.len()].copy_from_slice(raw);
}

/// Builds a fresh page-one raw buffer with its open marker stamped.
pub fn new_page_one_raw() -> Vec<u8> {
    let mut data = vec![0u8; PAGE_SIZE];
    stamp_open(&mut data);
    data
}

/// Stamps 8 random bytes into the open-marker window (called on every open).
pub fn stamp_open(data: &mut [u8]) {
    let mut marker = [0u8; VC_LEN];
    rand::rng().fill_bytes(&mut marker);
    data[VC_OPEN_OFFSET..VC_OPEN_OFFSET + VC_LEN].copy_from_slice(&marker);
}

/// Copies the open marker into the close-marker window (called on clean
/// close).
pub fn stamp_close(data: &mut [u8]) {
    let open = data[VC_OPEN_OFFSET..VC_OPEN_OFFSET + VC_LEN].to_vec();
    data[VC_CLOSE_OFFSET..VC_CLOSE_OFFSET + VC_LEN].copy_from_slice(&open);
}

/// True iff the open and close marker windows match — a clean previous
/// shutdown.
pub fn check_vc(data: &[u8]) -> bool {
    data[VC_OPEN_OFFSET..VC_OPEN_OFFSET + VC_LEN] == data[VC_CLOSE_OFFSET..VC_CLOSE_OFFSET + VC_LEN]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinary_insert_advances_fso() {
        let mut data = new_ordinary_raw();
        assert_eq!(fso(&data), 2);
        let off = insert(&mut data, b"hello");
        assert_eq!(off, 2);
        assert_eq!(fso(&data), 7);
        assert_eq!(&data[2..7], b"hello");
    }

    #[test]
    fn recover_insert_raises_fso_only_if_needed() {
        let mut data = new_ordinary_raw();
        set_fso(&mut data, 100);
        recover_insert(&mut data, 10, b"abc");
        assert_eq!(fso(&data), 100, "rewriting inside already-claimed space must not lower FSO");

        recover_insert(&mut data, 200, b"xyz");
        assert_eq!(fso(&data), 203);
    }

    #[test]
    fn vc_mismatch_before_close() {
        let data = new_page_one_raw();
        assert!(!check_vc(&data));
    }

    #[test]
    fn vc_matches_after_clean_close() {
        let mut data = new_page_one_raw();
        stamp_close(&mut data);
        assert!(check_vc(&data));
    }
}
