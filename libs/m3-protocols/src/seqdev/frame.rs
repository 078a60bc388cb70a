//! Sequence-device frame layer
//!
//! Byte layout of the CPU-addressed command and its response. All fields are
//! big-endian.
//!
//! ```text
//! request  = F1 | 01 | src | dest | 26 | sub | size | payload
//! payload  = accessType:u16 | devType:u16 | topDevNo:u32 | dataNum:u16 [| data:u16]
//! response = fmt | opt | src | dest | main | sub | errorCode:u16 | dataSize:u16 | data
//! ```

use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, warn};

use m3_comlink::{M3Error, RawData, Reply, Result, Routing, SeqDevCommand};

use super::constants::*;

/// Decoded response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub format_code: u8,
    pub response_option: u8,
    pub routing: Routing,
    pub main_code: u8,
    pub sub_code: u8,
    pub error_code: u16,
    pub data: Vec<u16>,
}

// ============================================================================
// Request
// ============================================================================

/// Serialize a request; the payload length must agree with `data_size`
pub fn encode_request(routing: Routing, cmd: &SeqDevCommand, dst: &mut BytesMut) -> Result<()> {
    let payload_len = if cmd.data.is_some() {
        DATA_SIZE_WRITE
    } else {
        DATA_SIZE_READ
    };
    if cmd.data_size != payload_len {
        return Err(M3Error::protocol(format!(
            "data size {} does not match {} byte payload",
            cmd.data_size, payload_len
        )));
    }

    dst.reserve(REQUEST_HEADER_LEN + payload_len as usize);
    dst.put_u8(cmd.format_code);
    dst.put_u8(cmd.response_option);
    dst.put_u8(routing.src_slot);
    dst.put_u8(routing.dest_slot);
    dst.put_u8(cmd.main_code);
    dst.put_u8(cmd.sub_code);
    dst.put_u8(cmd.data_size);
    dst.put_u16(cmd.access_type);
    dst.put_u16(cmd.device_type);
    dst.put_u32(cmd.top_index);
    dst.put_u16(cmd.data_num);
    if let Some(word) = cmd.data {
        dst.put_u16(word);
    }
    Ok(())
}

/// Parse a request (gateway side)
pub fn decode_request(mut src: &[u8]) -> Result<(Routing, SeqDevCommand)> {
    if src.len() < REQUEST_HEADER_LEN + DATA_SIZE_READ as usize {
        return Err(M3Error::protocol(format!(
            "request too short: {} bytes",
            src.len()
        )));
    }

    let format_code = src.get_u8();
    let response_option = src.get_u8();
    let routing = Routing::new(src.get_u8(), src.get_u8());
    let main_code = src.get_u8();
    let sub_code = src.get_u8();
    let data_size = src.get_u8();

    if format_code != FORMAT_CODE || main_code != MAIN_CODE_SEQDEV {
        return Err(M3Error::protocol(format!(
            "unexpected format/main code {:02X}/{:02X}",
            format_code, main_code
        )));
    }
    if src.remaining() != data_size as usize {
        return Err(M3Error::protocol(format!(
            "payload length {} != data size {}",
            src.remaining(),
            data_size
        )));
    }

    let access_type = src.get_u16();
    let device_type = src.get_u16();
    let top_index = src.get_u32();
    let data_num = src.get_u16();
    let data = match (sub_code, data_size) {
        (SUB_CODE_READ, DATA_SIZE_READ) => None,
        (SUB_CODE_WRITE, DATA_SIZE_WRITE) => Some(src.get_u16()),
        _ => {
            return Err(M3Error::protocol(format!(
                "sub code {:02X} with data size {}",
                sub_code, data_size
            )))
        },
    };

    Ok((
        routing,
        SeqDevCommand {
            format_code,
            response_option,
            main_code,
            sub_code,
            data_size,
            access_type,
            device_type,
            top_index,
            data_num,
            data,
        },
    ))
}

// ============================================================================
// Response
// ============================================================================

/// Serialize a response (gateway side)
pub fn encode_response(frame: &ResponseFrame, dst: &mut BytesMut) {
    dst.reserve(RESPONSE_HEADER_LEN + frame.data.len() * 2);
    dst.put_u8(frame.format_code);
    dst.put_u8(frame.response_option);
    dst.put_u8(frame.routing.src_slot);
    dst.put_u8(frame.routing.dest_slot);
    dst.put_u8(frame.main_code);
    dst.put_u8(frame.sub_code);
    dst.put_u16(frame.error_code);
    dst.put_u16((frame.data.len() * 2) as u16);
    for word in &frame.data {
        dst.put_u16(*word);
    }
}

pub fn decode_response(mut src: &[u8]) -> Result<ResponseFrame> {
    if src.len() < RESPONSE_HEADER_LEN {
        return Err(M3Error::protocol(format!(
            "response too short: {} bytes",
            src.len()
        )));
    }

    let format_code = src.get_u8();
    let response_option = src.get_u8();
    let routing = Routing::new(src.get_u8(), src.get_u8());
    let main_code = src.get_u8();
    let sub_code = src.get_u8();
    let error_code = src.get_u16();
    let data_size = src.get_u16() as usize;

    if data_size > MAX_RESPONSE_DATA || data_size % 2 != 0 {
        return Err(M3Error::protocol(format!("bad data size {}", data_size)));
    }
    if src.remaining() < data_size {
        return Err(M3Error::protocol(format!(
            "incomplete response: declared {} bytes, {} available",
            data_size,
            src.remaining()
        )));
    }
    if src.remaining() > data_size {
        warn!(
            "Response carries {} trailing bytes",
            src.remaining() - data_size
        );
    }

    let data = (0..data_size / 2).map(|_| src.get_u16()).collect();

    Ok(ResponseFrame {
        format_code,
        response_option,
        routing,
        main_code,
        sub_code,
        error_code,
        data,
    })
}

/// Build the response a module sends back for `cmd`
pub fn response_for(
    routing: Routing,
    cmd: &SeqDevCommand,
    error_code: u16,
    data: Vec<u16>,
) -> ResponseFrame {
    ResponseFrame {
        format_code: cmd.format_code,
        response_option: cmd.response_option,
        routing: Routing::new(routing.dest_slot, routing.src_slot),
        main_code: cmd.main_code,
        sub_code: cmd.sub_code,
        error_code,
        data,
    }
}

/// Check a response against the request it answers
pub fn validate_response(
    routing: Routing,
    cmd: &SeqDevCommand,
    frame: ResponseFrame,
) -> Result<Reply> {
    if frame.main_code != cmd.main_code || frame.sub_code != cmd.sub_code {
        return Err(M3Error::protocol(format!(
            "response {:02X}/{:02X} does not answer {:02X}/{:02X}",
            frame.main_code, frame.sub_code, cmd.main_code, cmd.sub_code
        )));
    }
    if frame.routing.src_slot != routing.dest_slot {
        return Err(M3Error::protocol(format!(
            "response from slot {}, expected {}",
            frame.routing.src_slot, routing.dest_slot
        )));
    }

    debug!(
        "SEQ RX: slot {} err={} {}w",
        frame.routing.src_slot,
        frame.error_code,
        frame.data.len()
    );

    if frame.error_code != 0 {
        return Ok(Reply::remote_error(frame.error_code));
    }
    Ok(Reply::ok(RawData::Words(frame.data)))
}
