use std::fmt;

/// Transport-level error code, as carried in CONNECTION_CLOSE
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct TransportError(pub u16);

impl From<TransportError> for u16 {
    fn from(x: TransportError) -> u16 {
        x.0
    }
}

macro_rules! errors {
    {$($name:ident($val:expr) $desc:expr;)*} => {
        impl TransportError {
            $(#[doc = $desc] pub const $name: Self = TransportError($val);)*
        }

        impl fmt::Debug for TransportError {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    _ => write!(f, "TransportError({:04x})", self.0),
                }
            }
        }

        impl fmt::Display for TransportError {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let x = match self.0 {
                    $($val => $desc,)*
                    _ => "unknown error",
                };
                f.write_str(x)
            }
        }
    }
}

errors! {
    NO_ERROR(0x0) "the connection is being closed abruptly in the absence of any error";
    INTERNAL_ERROR(0x1) "the endpoint encountered an internal error and cannot continue with the connection";
    SERVER_BUSY(0x2) "the server is currently busy and does not accept any new connections";
    FLOW_CONTROL_ERROR(0x3) "an endpoint received more data than it permitted in its advertised data limits";
    STREAM_LIMIT_ERROR(0x4) "an endpoint received a frame for a stream identifier that exceeded its advertised stream limit";
    STREAM_STATE_ERROR(0x5) "an endpoint received a frame for a stream that was not in a state that permitted that frame";
    FINAL_SIZE_ERROR(0x6) "an endpoint received inconsistent final sizes for a stream";
    FRAME_ENCODING_ERROR(0x7) "an endpoint received a frame that was badly formatted";
    TRANSPORT_PARAMETER_ERROR(0x8) "an endpoint received transport parameters that were badly formatted or invalid";
    PROTOCOL_VIOLATION(0xA) "an endpoint detected an error with protocol compliance that was not covered by more specific error codes";
    INVALID_TOKEN(0xB) "a server received a client Initial that contained an invalid Token field";
    KEY_UPDATE_ERROR(0xE) "an endpoint detected errors in performing key updates";
}
