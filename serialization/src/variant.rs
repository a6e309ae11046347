use anyhow::bail;
use bytes::Bytes;

use crate::meta_struct::MetaStruct;
use crate::shared_str::SharedStr;
use crate::stream::{Serialize, Serializer};

/// A tagged union over the closed list of serializable types, plus the recursive
///  struct and array shapes of schema-less payloads.
///
/// On the wire: a u8 tag (the variant's position in the list below), then the
///  alternative's own encoding under its default policy. The tag order is part of
///  the wire format and must not be rearranged.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Str(SharedStr),
    Buffer(Bytes),
    F64(f64),
    F32(f32),
    I64(i64),
    U64(u64),
    I32(i32),
    U32(u32),
    I16(i16),
    U16(u16),
    I8(i8),
    U8(u8),
    Bool(bool),
    Struct(Box<MetaStruct>),
    Array(Vec<Value>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Bool(false)
    }
}

impl Value {
    fn tag(&self) -> u8 {
        match self {
            Value::Str(_) => 0,
            Value::Buffer(_) => 1,
            Value::F64(_) => 2,
            Value::F32(_) => 3,
            Value::I64(_) => 4,
            Value::U64(_) => 5,
            Value::I32(_) => 6,
            Value::U32(_) => 7,
            Value::I16(_) => 8,
            Value::U16(_) => 9,
            Value::I8(_) => 10,
            Value::U8(_) => 11,
            Value::Bool(_) => 12,
            Value::Struct(_) => 13,
            Value::Array(_) => 14,
        }
    }

    fn default_for_tag(tag: u8) -> anyhow::Result<Value> {
        Ok(match tag {
            0 => Value::Str(SharedStr::default()),
            1 => Value::Buffer(Bytes::new()),
            2 => Value::F64(0.0),
            3 => Value::F32(0.0),
            4 => Value::I64(0),
            5 => Value::U64(0),
            6 => Value::I32(0),
            7 => Value::U32(0),
            8 => Value::I16(0),
            9 => Value::U16(0),
            10 => Value::I8(0),
            11 => Value::U8(0),
            12 => Value::Bool(false),
            13 => Value::Struct(Box::default()),
            14 => Value::Array(Vec::new()),
            other => bail!("invalid value tag {}", other),
        })
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&SharedStr> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&MetaStruct> {
        match self {
            Value::Struct(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }
}

impl Serialize for Value {
    fn serialize(&mut self, s: &mut Serializer) -> anyhow::Result<()> {
        let mut tag = self.tag();
        s.value(&mut tag)?;
        if s.is_reading() {
            *self = Value::default_for_tag(tag)?;
        }

        match self {
            Value::Str(v) => s.value(v),
            Value::Buffer(v) => s.value(v),
            Value::F64(v) => s.value(v),
            Value::F32(v) => s.value(v),
            Value::I64(v) => s.value(v),
            Value::U64(v) => s.value(v),
            Value::I32(v) => s.value(v),
            Value::U32(v) => s.value(v),
            Value::I16(v) => s.value(v),
            Value::U16(v) => s.value(v),
            Value::I8(v) => s.value(v),
            Value::U8(v) => s.value(v),
            Value::Bool(v) => s.value(v),
            Value::Struct(v) => v.serialize(s),
            Value::Array(v) => v.serialize(s),
        }
    }
}
