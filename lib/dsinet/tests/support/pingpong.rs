//! Hand-written rendition of the code a service generator would emit for
//! the ping-pong test interface: update ids, typed call wrappers over the
//! client and server contexts and decode helpers for both directions.

use dsibase::attr::{read_partial, write_partial, ClientAttribute, ServerAttribute};
use dsibase::ostream::OStream;
use dsibase::wire::{DataState, ResultType, UpdateType};
use dsibase::{INVALID_ID, REQUEST_ID_FIRST, RESPONSE_ID_FIRST, ATTRIBUTE_ID_FIRST};
use dsinet::{ClientCtx, RequestHandle, ResponseHandle, ServerCtx};

pub const INTERFACE: &str = "PingPongTest";
pub const MAJOR: u32 = 1;
pub const MINOR: u32 = 4;

pub const UPD_ID_REQUEST_PING: u32 = REQUEST_ID_FIRST + 1;
pub const UPD_ID_REQUEST_EVAL: u32 = REQUEST_ID_FIRST + 2;
pub const UPD_ID_REQUEST_STOP: u32 = REQUEST_ID_FIRST + 3;
pub const UPD_ID_REGISTER_RISING_VALUE: u32 = REQUEST_ID_FIRST + 4;

pub const UPD_ID_RESPONSE_PONG: u32 = RESPONSE_ID_FIRST + 1;
pub const UPD_ID_RESPONSE_EVALED: u32 = RESPONSE_ID_FIRST + 2;
pub const UPD_ID_RESPONSE_STOPPED: u32 = RESPONSE_ID_FIRST + 3;
pub const UPD_ID_INFORMATION_RISING_VALUE: u32 = RESPONSE_ID_FIRST + 4;

pub const UPD_ID_MY_INT_ATTR: u32 = ATTRIBUTE_ID_FIRST + 1;
pub const UPD_ID_MY_VECTOR_ATTR: u32 = ATTRIBUTE_ID_FIRST + 2;

/// Request-to-response correlation of this interface.
pub fn response_of(request_id: u32) -> u32 {
    match request_id {
        UPD_ID_REQUEST_PING => UPD_ID_RESPONSE_PONG,
        UPD_ID_REQUEST_EVAL => UPD_ID_RESPONSE_EVALED,
        UPD_ID_REQUEST_STOP => UPD_ID_RESPONSE_STOPPED,
        _ => INVALID_ID,
    }
}

// ---------------------------------------------------------------------
// proxy side

pub fn request_ping(ctx: &mut ClientCtx, message: &str) -> i32 {
    let message = message.to_owned();
    ctx.send_request(UPD_ID_REQUEST_PING, &move |os: &mut OStream| {
        os.write_str(&message)
    })
}

pub fn request_eval(ctx: &mut ClientCtx) -> i32 {
    ctx.send_request(UPD_ID_REQUEST_EVAL, &|_os: &mut OStream| {})
}

pub fn request_stop(ctx: &mut ClientCtx) -> i32 {
    ctx.send_request(UPD_ID_REQUEST_STOP, &|_os: &mut OStream| {})
}

pub fn notify_on_my_int_attr(ctx: &mut ClientCtx) {
    ctx.notify_on(UPD_ID_MY_INT_ATTR);
}

pub fn notify_on_my_vector_attr(ctx: &mut ClientCtx) {
    ctx.notify_on(UPD_ID_MY_VECTOR_ATTR);
}

pub fn notify_on_information_rising_value(ctx: &mut ClientCtx) {
    ctx.notify_on(UPD_ID_INFORMATION_RISING_VALUE);
}

/// Open a register session on the rising-value information. Returns the
/// session sequence number.
pub fn register_rising_value(ctx: &mut ClientCtx, wanted: bool) -> i32 {
    let session = ctx.register_notify(&[UPD_ID_INFORMATION_RISING_VALUE]);
    ctx.send_request_with_sequence(UPD_ID_REGISTER_RISING_VALUE, session, &move |os| {
        os.write_bool(wanted)
    });
    session
}

pub fn unregister_rising_value(ctx: &mut ClientCtx, session: i32) {
    ctx.stop_all_register_notifies(session);
}

/// What the server said, decoded. Attribute updates are applied to the
/// supplied client attributes before the event is returned.
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyEvent {
    Pong(String),
    Evaled,
    Stopped,
    RisingValue(bool),
    IntAttrUpdate(i64, DataState),
    VectorAttrUpdate(DataState, UpdateType, i16, i16),
    PingFailed(ResultType),
    ResponseInvalid(u32),
}

pub fn decode_response(
    response: &ResponseHandle,
    int_attr: &mut ClientAttribute<i64>,
    vector_attr: &mut ClientAttribute<Vec<String>>,
) -> Option<ProxyEvent> {
    let result = response.result_type()?;
    let mut is = response.istream();

    match response.update_id() {
        UPD_ID_RESPONSE_PONG => match result {
            ResultType::Ok => Some(ProxyEvent::Pong(is.read_str())),
            ResultType::Invalid => Some(ProxyEvent::ResponseInvalid(UPD_ID_RESPONSE_PONG)),
            _ => None,
        },

        UPD_ID_RESPONSE_EVALED => match result {
            ResultType::Ok => Some(ProxyEvent::Evaled),
            ResultType::Invalid => Some(ProxyEvent::ResponseInvalid(UPD_ID_RESPONSE_EVALED)),
            _ => None,
        },

        UPD_ID_RESPONSE_STOPPED => match result {
            ResultType::Ok => Some(ProxyEvent::Stopped),
            ResultType::Invalid => Some(ProxyEvent::ResponseInvalid(UPD_ID_RESPONSE_STOPPED)),
            _ => None,
        },

        UPD_ID_INFORMATION_RISING_VALUE => match result {
            ResultType::Ok => Some(ProxyEvent::RisingValue(is.read_bool())),
            _ => None,
        },

        UPD_ID_REQUEST_PING => match result {
            ResultType::RequestError | ResultType::RequestBusy => {
                Some(ProxyEvent::PingFailed(result))
            }
            _ => None,
        },

        UPD_ID_MY_INT_ATTR => match result {
            ResultType::DataOk => {
                int_attr.value = is.read_i64();
                int_attr.set_state(DataState::Ok);
                Some(ProxyEvent::IntAttrUpdate(*int_attr.get(), DataState::Ok))
            }
            ResultType::DataInvalid => {
                int_attr.set_state(DataState::Invalid);
                Some(ProxyEvent::IntAttrUpdate(*int_attr.get(), DataState::Invalid))
            }
            _ => None,
        },

        UPD_ID_MY_VECTOR_ATTR => match result {
            ResultType::DataOk => {
                let (kind, position, count) = read_partial(&mut is, &mut vector_attr.value);
                vector_attr.set_state(DataState::Ok);
                Some(ProxyEvent::VectorAttrUpdate(DataState::Ok, kind, position, count))
            }
            ResultType::DataInvalid => {
                vector_attr.set_state(DataState::Invalid);
                Some(ProxyEvent::VectorAttrUpdate(
                    DataState::Invalid,
                    UpdateType::None,
                    0,
                    0,
                ))
            }
            _ => None,
        },

        _ => None,
    }
}

// ---------------------------------------------------------------------
// stub side

#[derive(Debug, Clone, PartialEq)]
pub enum StubRequest {
    Ping(String),
    Eval,
    Stop,
    RegisterRisingValue(bool),
}

pub fn decode_request(request: &RequestHandle) -> Option<StubRequest> {
    let mut is = request.istream();

    match request.request_id() {
        UPD_ID_REQUEST_PING => Some(StubRequest::Ping(is.read_str())),
        UPD_ID_REQUEST_EVAL => Some(StubRequest::Eval),
        UPD_ID_REQUEST_STOP => Some(StubRequest::Stop),
        UPD_ID_REGISTER_RISING_VALUE => Some(StubRequest::RegisterRisingValue(is.read_bool())),
        _ => None,
    }
}

pub fn response_pong(ctx: &mut ServerCtx, message: &str) {
    let message = message.to_owned();
    ctx.send_response(UPD_ID_RESPONSE_PONG, &move |os| os.write_str(&message));
}

pub fn response_evaled(ctx: &mut ServerCtx) {
    ctx.send_response(UPD_ID_RESPONSE_EVALED, &|_os| {});
}

pub fn response_stopped(ctx: &mut ServerCtx) {
    ctx.send_response(UPD_ID_RESPONSE_STOPPED, &|_os| {});
}

pub fn information_rising_value(ctx: &mut ServerCtx, value: bool) {
    ctx.send_response(UPD_ID_INFORMATION_RISING_VALUE, &move |os| {
        os.write_bool(value)
    });
}

pub fn set_my_int_attr(ctx: &mut ServerCtx, attr: &mut ServerAttribute<i64>, value: i64) {
    attr.set(value);
    let value = *attr.get();
    ctx.notify_attribute(UPD_ID_MY_INT_ATTR, DataState::Ok, &move |os| {
        os.write_i64(value)
    });
}

pub fn invalidate_my_int_attr(ctx: &mut ServerCtx, attr: &mut ServerAttribute<i64>) {
    attr.invalidate();
    ctx.notify_attribute(UPD_ID_MY_INT_ATTR, DataState::Invalid, &|_os| {});
}

pub fn set_my_vector_attr(
    ctx: &mut ServerCtx,
    attr: &mut ServerAttribute<Vec<String>>,
    values: &[String],
    kind: UpdateType,
    position: i16,
    count: i16,
) {
    attr.update(values, kind, position, count);
    let snapshot = attr.get().clone();
    ctx.notify_attribute(UPD_ID_MY_VECTOR_ATTR, DataState::Ok, &move |os| {
        write_partial(os, &snapshot, kind, position, count)
    });
}

/// `Stub::write_attribute` body for stubs carrying both attributes.
pub fn write_attribute(
    int_attr: &ServerAttribute<i64>,
    vector_attr: &ServerAttribute<Vec<String>>,
    id: u32,
    os: &mut OStream,
    kind: UpdateType,
    position: i16,
    count: i16,
) {
    match id {
        UPD_ID_MY_INT_ATTR => os.write_i64(*int_attr.get()),
        UPD_ID_MY_VECTOR_ATTR => write_partial(os, vector_attr.get(), kind, position, count),
        _ => (),
    }
}

/// `Stub::attribute_state` body for stubs carrying both attributes.
pub fn attribute_state(
    int_attr: &ServerAttribute<i64>,
    vector_attr: &ServerAttribute<Vec<String>>,
    id: u32,
) -> DataState {
    match id {
        UPD_ID_MY_INT_ATTR => int_attr.state(),
        UPD_ID_MY_VECTOR_ATTR => vector_attr.state(),
        _ => DataState::NotAvailable,
    }
}
