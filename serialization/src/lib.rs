//! A length-prefixed, bit-packed serialization framework with policy-driven
//!  encoding.
//!
//! The wire primitive is the bit stream: integers are written with only their
//!  effective bits (prefixed by a small bit count), bools cost a single bit, and
//!  strings and buffers are u32-length-prefixed with their bodies aligned to the
//!  next byte boundary. The bit image is identical on every host endianness.
//!
//! On top of the raw stream sit *data policies*: named, per-type strategies that
//!  decide how a value is encoded. Every supported type has a default policy
//!  (variable-width integers, quantized floats, plain strings); applications
//!  register alternatives by class name and select them per value - e.g. the
//!  `unique` string policy, which writes a repeated string once and backreferences
//!  it afterwards. Policies can carry per-session state and are reset at the start
//!  of every encode/decode session.
//!
//! [`Value`](variant::Value) and [`MetaStruct`](meta_struct::MetaStruct) close the
//!  loop for schema-less payloads: a tagged union over the supported types plus
//!  recursive structs and arrays.

pub mod bit_stream;
pub mod meta_struct;
pub mod metadata;
pub mod policy;
pub mod quantization;
pub mod shared_str;
pub mod stream;
pub mod unique_string;
pub mod variant;
