//! Pure frame-decoding functions. No I/O, no state, never panics on
//! malformed input — the transport layer hands raw bytes in, a typed record
//! comes out.

pub mod sensor;
pub mod timer;
