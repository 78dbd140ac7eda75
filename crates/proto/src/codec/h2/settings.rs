//! SETTINGS parameters (RFC 9113 section 6.5.2).

use bytes::{BufMut, Bytes, BytesMut};

use super::frame::{DEFAULT_MAX_FRAME_SIZE, ErrorCode, Frame, MAX_MAX_FRAME_SIZE, MAX_WINDOW_SIZE};
use crate::protocol::H2Error;

pub const HEADER_TABLE_SIZE: u16 = 0x1;
pub const ENABLE_PUSH: u16 = 0x2;
pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
pub const MAX_FRAME_SIZE: u16 = 0x5;
pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;

/// A set of SETTINGS values; `None` means the parameter is not carried.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_header_list_size: Option<u32>,
}

impl Settings {
    /// Validate the parameters received in a SETTINGS frame. Unknown identifiers are ignored.
    pub fn from_pairs(pairs: &[(u16, u32)]) -> Result<Self, H2Error> {
        let mut settings = Settings::default();
        for &(id, value) in pairs {
            match id {
                HEADER_TABLE_SIZE => settings.header_table_size = Some(value),
                ENABLE_PUSH => {
                    if value > 1 {
                        return Err(H2Error::protocol(format!("invalid SETTINGS_ENABLE_PUSH {value}")));
                    }
                    settings.enable_push = Some(value == 1);
                }
                MAX_CONCURRENT_STREAMS => settings.max_concurrent_streams = Some(value),
                INITIAL_WINDOW_SIZE => {
                    if value > MAX_WINDOW_SIZE {
                        return Err(H2Error::with_code(
                            ErrorCode::FLOW_CONTROL_ERROR,
                            format!("invalid SETTINGS_INITIAL_WINDOW_SIZE {value}"),
                        ));
                    }
                    settings.initial_window_size = Some(value);
                }
                MAX_FRAME_SIZE => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) {
                        return Err(H2Error::protocol(format!("invalid SETTINGS_MAX_FRAME_SIZE {value}")));
                    }
                    settings.max_frame_size = Some(value);
                }
                MAX_HEADER_LIST_SIZE => settings.max_header_list_size = Some(value),
                _ => {}
            }
        }
        Ok(settings)
    }

    pub fn to_pairs(&self) -> Vec<(u16, u32)> {
        let mut pairs = Vec::with_capacity(6);
        if let Some(value) = self.header_table_size {
            pairs.push((HEADER_TABLE_SIZE, value));
        }
        if let Some(value) = self.enable_push {
            pairs.push((ENABLE_PUSH, u32::from(value)));
        }
        if let Some(value) = self.max_concurrent_streams {
            pairs.push((MAX_CONCURRENT_STREAMS, value));
        }
        if let Some(value) = self.initial_window_size {
            pairs.push((INITIAL_WINDOW_SIZE, value));
        }
        if let Some(value) = self.max_frame_size {
            pairs.push((MAX_FRAME_SIZE, value));
        }
        if let Some(value) = self.max_header_list_size {
            pairs.push((MAX_HEADER_LIST_SIZE, value));
        }
        pairs
    }

    /// The raw SETTINGS payload, as carried base64 encoded by the `HTTP2-Settings` upgrade header.
    pub fn payload(&self) -> Bytes {
        let pairs = self.to_pairs();
        let mut buf = BytesMut::with_capacity(pairs.len() * 6);
        for (id, value) in pairs {
            buf.put_u16(id);
            buf.put_u32(value);
        }
        buf.freeze()
    }

    /// Overlay the parameters present in `other`.
    pub fn merge(&mut self, other: &Settings) {
        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        overlay!(
            header_table_size,
            enable_push,
            max_concurrent_streams,
            initial_window_size,
            max_frame_size,
            max_header_list_size
        );
    }

    pub fn to_frame(&self) -> Frame {
        Frame::Settings { ack: false, settings: self.to_pairs() }
    }
}
