//! Object headers: the message lists describing datasets and groups.
//!
//! Both header versions are read into the same flat message list, with
//! continuation blocks followed in place.

use std::collections::HashSet;

use log::{trace, warn};

use crate::error::Error;
use crate::io::{Cursor, OpenFile};

const OHDR_SIGNATURE: &[u8; 4] = b"OHDR";
const OCHK_SIGNATURE: &[u8; 4] = b"OCHK";

// ---- HDF5 object header message types ----

pub const MSG_NIL: u16 = 0x0000;
pub const MSG_DATASPACE: u16 = 0x0001;
pub const MSG_LINK_INFO: u16 = 0x0002;
pub const MSG_DATATYPE: u16 = 0x0003;
pub const MSG_FILL_VALUE_OLD: u16 = 0x0004;
pub const MSG_FILL_VALUE: u16 = 0x0005;
pub const MSG_LINK: u16 = 0x0006;
pub const MSG_DATA_LAYOUT: u16 = 0x0008;
pub const MSG_FILTER_PIPELINE: u16 = 0x000B;
pub const MSG_ATTRIBUTE: u16 = 0x000C;
pub const MSG_CONTINUATION: u16 = 0x0010;
pub const MSG_SYMBOL_TABLE: u16 = 0x0011;

const MSG_FLAG_SHARED: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderMessage {
    pub msg_type: u16,
    pub flags: u8,
    pub data: Vec<u8>,
}

impl HeaderMessage {
    pub fn is_shared(&self) -> bool {
        self.flags & MSG_FLAG_SHARED != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHeader {
    pub address: u64,
    pub version: u8,
    pub messages: Vec<HeaderMessage>,
}

impl ObjectHeader {
    /// Reads the header at `address`, following at most `max_depth` continuation blocks.
    pub fn read(file: &OpenFile, address: u64, max_depth: usize) -> Result<Self, Error> {
        let prefix = file.read_bytes_upto(address, 16)?;
        let mut messages = Vec::new();
        let mut pending = Vec::new();
        let mut order_width = 0;
        let version = if prefix.starts_with(OHDR_SIGNATURE) {
            order_width = read_v2_prefix(file, address, &mut messages, &mut pending)?;
            2
        } else {
            read_v1_prefix(file, address, &prefix, &mut messages, &mut pending)?;
            1
        };

        let mut visited = HashSet::new();
        while let Some((block, length)) = pending.pop() {
            if !visited.insert(block) || visited.len() > max_depth {
                return Err(Error::InvalidFileStructure(format!(
                    "Object header at {} has looping or too many continuation blocks",
                    address
                )));
            }
            let raw = file.read_bytes(block, length as usize)?;
            if version == 1 {
                parse_v1_messages(&raw, file, &mut messages, &mut pending)?;
            } else {
                let mut c = Cursor::new(&raw, file.ctx());
                c.expect_signature(OCHK_SIGNATURE, block)?;
                let end = raw.len().saturating_sub(4);
                parse_v2_messages(&raw[..end], 4, order_width, file, &mut messages, &mut pending)?;
            }
        }

        trace!("Object header at {}: {} messages", address, messages.len());
        Ok(ObjectHeader {
            address,
            version,
            messages,
        })
    }

    pub fn find(&self, msg_type: u16) -> Option<&HeaderMessage> {
        self.messages.iter().find(|m| m.msg_type == msg_type)
    }

    pub fn find_all(&self, msg_type: u16) -> impl Iterator<Item = &HeaderMessage> {
        self.messages.iter().filter(move |m| m.msg_type == msg_type)
    }

    /// Message data of `msg_type`, following a shared message to the header that holds it.
    pub fn message_data(&self, file: &OpenFile, msg_type: u16, max_depth: usize) -> Result<Option<Vec<u8>>, Error> {
        let Some(msg) = self.find(msg_type) else {
            return Ok(None);
        };
        if !msg.is_shared() {
            return Ok(Some(msg.data.clone()));
        }
        if max_depth == 0 {
            return Err(Error::InvalidFileStructure(
                "Shared message recursion depth exceeded".to_string(),
            ));
        }
        let target = shared_message_address(&msg.data, file)?;
        let other = ObjectHeader::read(file, target, max_depth)?;
        other.message_data(file, msg_type, max_depth - 1)
    }
}

/// Address of the object header holding a shared message.
fn shared_message_address(data: &[u8], file: &OpenFile) -> Result<u64, Error> {
    let mut c = Cursor::new(data, file.ctx());
    let version = c.read_u8()?;
    let kind = c.read_u8()?;
    match version {
        1 => {
            c.skip(6)?;
            c.read_offset()
        }
        2 => c.read_offset(),
        3 if kind == 2 => c.read_offset(),
        _ => Err(Error::Other(format!(
            "Shared message version {} type {} is not supported",
            version, kind
        ))),
    }
}

fn read_v1_prefix(
    file: &OpenFile,
    address: u64,
    prefix: &[u8],
    messages: &mut Vec<HeaderMessage>,
    pending: &mut Vec<(u64, u64)>,
) -> Result<(), Error> {
    // version(1) + reserved(1) + num_messages(2) + ref_count(4) + header_size(4), padded to 16
    let mut c = Cursor::new(prefix, file.ctx());
    let version = c.read_u8()?;
    if version != 1 {
        return Err(Error::InvalidFileStructure(format!(
            "Unsupported object header version {} at {}",
            version, address
        )));
    }
    c.skip(1)?;
    let _num_messages = c.read_u16()?;
    let _ref_count = c.read_u32()?;
    let header_size = c.read_u32()? as usize;
    let raw = file.read_bytes(address + 16, header_size)?;
    parse_v1_messages(&raw, file, messages, pending)
}

fn parse_v1_messages(
    raw: &[u8],
    file: &OpenFile,
    messages: &mut Vec<HeaderMessage>,
    pending: &mut Vec<(u64, u64)>,
) -> Result<(), Error> {
    let mut c = Cursor::new(raw, file.ctx());
    // type(2) + size(2) + flags(1) + reserved(3)
    while c.remaining() >= 8 {
        let msg_type = c.read_u16()?;
        let size = c.read_u16()? as usize;
        let flags = c.read_u8()?;
        c.skip(3)?;
        let data = c.read_bytes(size)?;
        push_message(msg_type, flags, data, file, messages, pending)?;
        let aligned = c.position().div_ceil(8) * 8;
        if aligned > raw.len() {
            break;
        }
        c.seek(aligned);
    }
    Ok(())
}

/// Returns the width of the per-message creation order field.
fn read_v2_prefix(
    file: &OpenFile,
    address: u64,
    messages: &mut Vec<HeaderMessage>,
    pending: &mut Vec<(u64, u64)>,
) -> Result<usize, Error> {
    // sig(4) + version(1) + flags(1) + [times(16)] + [attr phase change(4)] + chunk0 size(1..8)
    let head = file.read_bytes_upto(address, 4 + 1 + 1 + 16 + 4 + 8)?;
    let mut c = Cursor::new(&head, file.ctx());
    c.skip(4)?;
    let version = c.read_u8()?;
    if version != 2 {
        return Err(Error::InvalidFileStructure(format!(
            "Unsupported OHDR version {} at {}",
            version, address
        )));
    }
    let flags = c.read_u8()?;
    if flags & 0x20 != 0 {
        c.skip(16)?;
    }
    if flags & 0x10 != 0 {
        c.skip(4)?;
    }
    let chunk0_size = c.read_uint(1 << (flags & 0x03))? as usize;
    let start = c.position();
    let raw = file.read_bytes(address + start as u64, chunk0_size)?;
    let order_width = if flags & 0x04 != 0 { 2 } else { 0 };
    parse_v2_messages(&raw, 0, order_width, file, messages, pending)?;
    Ok(order_width)
}

/// Parses v2 messages from `raw[start..]`; `extra` is the creation order field width.
fn parse_v2_messages(
    raw: &[u8],
    start: usize,
    extra: usize,
    file: &OpenFile,
    messages: &mut Vec<HeaderMessage>,
    pending: &mut Vec<(u64, u64)>,
) -> Result<(), Error> {
    let mut c = Cursor::new(raw, file.ctx());
    c.seek(start);
    // type(1) + size(2) + flags(1) + [creation order(2)]
    let header_len = 4 + extra;
    while c.remaining() >= header_len {
        let msg_type = c.read_u8()? as u16;
        let size = c.read_u16()? as usize;
        let flags = c.read_u8()?;
        c.skip(extra)?;
        if size > c.remaining() {
            warn!("Object header message of {} bytes overruns its block", size);
            break;
        }
        let data = c.read_bytes(size)?;
        push_message(msg_type, flags, data, file, messages, pending)?;
    }
    Ok(())
}

fn push_message(
    msg_type: u16,
    flags: u8,
    data: &[u8],
    file: &OpenFile,
    messages: &mut Vec<HeaderMessage>,
    pending: &mut Vec<(u64, u64)>,
) -> Result<(), Error> {
    match msg_type {
        MSG_NIL => {}
        MSG_CONTINUATION => {
            let mut c = Cursor::new(data, file.ctx());
            let block = c.read_offset()?;
            let length = c.read_length()?;
            if !file.ctx().is_undefined(block) && length > 0 {
                pending.push((block, length));
            }
        }
        _ => messages.push(HeaderMessage {
            msg_type,
            flags,
            data: data.to_vec(),
        }),
    }
    Ok(())
}
