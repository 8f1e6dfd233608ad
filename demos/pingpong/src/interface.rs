//! Generated-style glue for the demo's ping-pong service interface.

use dsibase::ostream::OStream;
use dsibase::{INVALID_ID, REQUEST_ID_FIRST, RESPONSE_ID_FIRST};
use dsinet::{ClientCtx, RequestHandle, ResponseHandle, ServerCtx};

pub const INTERFACE: &str = "PingPong";
pub const MAJOR: u32 = 1;
pub const MINOR: u32 = 0;

pub const UPD_ID_REQUEST_PING: u32 = REQUEST_ID_FIRST + 1;
pub const UPD_ID_RESPONSE_PONG: u32 = RESPONSE_ID_FIRST + 1;

pub fn response_of(request_id: u32) -> u32 {
    match request_id {
        UPD_ID_REQUEST_PING => UPD_ID_RESPONSE_PONG,
        _ => INVALID_ID,
    }
}

pub fn request_ping(ctx: &mut ClientCtx, message: &str) -> i32 {
    ctx.send_request(UPD_ID_REQUEST_PING, &|os: &mut OStream| os.write_str(message))
}

pub fn response_pong(ctx: &mut ServerCtx, message: &str) {
    ctx.send_response(UPD_ID_RESPONSE_PONG, &|os: &mut OStream| os.write_str(message));
}

/// Decoded ping request, if the handle carries one.
pub fn decode_ping(request: &RequestHandle) -> Option<String> {
    if request.request_id() != UPD_ID_REQUEST_PING {
        return None;
    }

    let mut is = request.istream();
    let message = is.read_str();

    if is.has_error() {
        return None;
    }

    Some(message)
}

/// Decoded pong response, if the handle carries one.
pub fn decode_pong(response: &ResponseHandle) -> Option<String> {
    if response.update_id() != UPD_ID_RESPONSE_PONG {
        return None;
    }

    let mut is = response.istream();
    let message = is.read_str();

    if is.has_error() {
        return None;
    }

    Some(message)
}
