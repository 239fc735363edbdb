//! Percent-encoding of protocol arguments.
//!
//! Every byte outside `[A-Za-z0-9_.~/-]` is escaped, so an encoded argument
//! never contains whitespace or a comma and survives the line framing.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

const ARG_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~')
    .remove(b'/');

/// Encode a single argument for transmission.
pub fn quote(arg: &str) -> String {
    utf8_percent_encode(arg, ARG_ENCODE_SET).to_string()
}

/// Decode a single received token. Invalid UTF-8 is replaced, not rejected.
pub fn unquote(token: &str) -> String {
    percent_decode_str(token).decode_utf8_lossy().into_owned()
}
