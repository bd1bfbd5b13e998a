//! SETTINGS frame parameters (RFC 7540 §6.5), just the ones this engine reads or
//! writes.

use bytes::{Buf, BufMut, Bytes};

pub const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
pub const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;

#[derive(Debug, Clone, Copy, Default)]
pub struct Settings {
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
}

pub fn parse(mut payload: Bytes) -> Settings {
    let mut settings = Settings::default();
    while payload.remaining() >= 6 {
        let id = payload.get_u16();
        let value = payload.get_u32();
        match id {
            id if id == SETTINGS_INITIAL_WINDOW_SIZE => settings.initial_window_size = Some(value),
            id if id == SETTINGS_MAX_FRAME_SIZE => settings.max_frame_size = Some(value),
            _ => {}
        }
    }
    settings
}

pub fn encode_initial(max_frame_size: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6);
    buf.put_u16(SETTINGS_MAX_FRAME_SIZE);
    buf.put_u32(max_frame_size);
    buf
}
