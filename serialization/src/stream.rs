use bytes::Bytes;

use crate::bit_stream::{BitStreamReader, BitStreamWriter};
use crate::policy::{DataPolicyContainer, Policied};
use crate::shared_str::SharedStr;

enum Io<'a> {
    Read(BitStreamReader<'a>),
    Write(BitStreamWriter),
}

/// One encode or decode session over a policy container.
///
/// Constructing a serializer starts a session: every policy in the container is
///  reset, so session-scoped state (like the `unique` string dictionary) starts
///  fresh. Values go through [`Serializer::value`] (default policy) or
///  [`Serializer::value_with`] (named policy); composite types implement
///  [`Serialize`] and are direction-agnostic - the same code reads and writes.
pub struct Serializer<'a> {
    container: &'a mut DataPolicyContainer,
    io: Io<'a>,
}

impl<'a> Serializer<'a> {
    pub fn writing(container: &'a mut DataPolicyContainer) -> Serializer<'a> {
        container.reset_policies();
        Serializer {
            container,
            io: Io::Write(BitStreamWriter::new()),
        }
    }

    pub fn reading(container: &'a mut DataPolicyContainer, input: &'a [u8]) -> Serializer<'a> {
        container.reset_policies();
        Serializer {
            container,
            io: Io::Read(BitStreamReader::new(input)),
        }
    }

    pub fn is_reading(&self) -> bool {
        matches!(self.io, Io::Read(_))
    }

    pub fn value<T: Policied>(&mut self, value: &mut T) -> anyhow::Result<()> {
        self.value_with(value, "")
    }

    pub fn value_with<T: Policied>(&mut self, value: &mut T, policy: &str) -> anyhow::Result<()> {
        let p = T::node_mut(self.container).policy_mut(policy);
        match &mut self.io {
            Io::Read(reader) => *value = p.read(reader)?,
            Io::Write(writer) => p.write(writer, value),
        }
        Ok(())
    }

    /// The accumulated bit image of a writing session; empty for readers.
    pub fn into_bytes(self) -> Bytes {
        match self.io {
            Io::Write(writer) => writer.into_bytes(),
            Io::Read(_) => Bytes::new(),
        }
    }
}

/// A composite type that can push itself through a [`Serializer`], reading or
///  writing depending on the session direction.
pub trait Serialize {
    fn serialize(&mut self, s: &mut Serializer) -> anyhow::Result<()>;
}

macro_rules! impl_serialize_scalar {
    ($t:ty) => {
        impl Serialize for $t {
            fn serialize(&mut self, s: &mut Serializer) -> anyhow::Result<()> {
                s.value(self)
            }
        }
    };
}

impl_serialize_scalar!(bool);
impl_serialize_scalar!(u8);
impl_serialize_scalar!(i8);
impl_serialize_scalar!(u16);
impl_serialize_scalar!(i16);
impl_serialize_scalar!(u32);
impl_serialize_scalar!(i32);
impl_serialize_scalar!(u64);
impl_serialize_scalar!(i64);
impl_serialize_scalar!(f32);
impl_serialize_scalar!(f64);
impl_serialize_scalar!(SharedStr);
impl_serialize_scalar!(Bytes);

/// Containers: a u32 element count, then the elements in order.
impl<T: Serialize + Default> Serialize for Vec<T> {
    fn serialize(&mut self, s: &mut Serializer) -> anyhow::Result<()> {
        let mut count = self.len() as u32;
        s.value(&mut count)?;
        if s.is_reading() {
            self.clear();
            self.resize_with(count as usize, T::default);
        }
        for element in self.iter_mut() {
            element.serialize(s)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, PartialEq, Debug, Clone)]
    struct Sample {
        id: u32,
        label: SharedStr,
        ratio: f64,
    }

    impl Serialize for Sample {
        fn serialize(&mut self, s: &mut Serializer) -> anyhow::Result<()> {
            s.value(&mut self.id)?;
            s.value_with(&mut self.label, "unique")?;
            s.value(&mut self.ratio)?;
            Ok(())
        }
    }

    #[test]
    fn test_composite_round_trip() {
        let mut container = DataPolicyContainer::standard();

        let mut original = Sample {
            id: 42,
            label: SharedStr::from("label"),
            ratio: 0.25,
        };
        let mut s = Serializer::writing(&mut container);
        original.serialize(&mut s).unwrap();
        let bytes = s.into_bytes();

        let mut restored = Sample::default();
        let mut s = Serializer::reading(&mut container, &bytes);
        restored.serialize(&mut s).unwrap();

        assert_eq!(restored.id, original.id);
        assert_eq!(restored.label, original.label);
        assert!((restored.ratio - original.ratio).abs() < 1e-6);
    }

    #[test]
    fn test_vec_of_composites_round_trip() {
        let mut container = DataPolicyContainer::standard();

        let mut original = vec![
            Sample { id: 1, label: SharedStr::from("same"), ratio: 0.5 },
            Sample { id: 2, label: SharedStr::from("same"), ratio: 1.5 },
            Sample { id: 3, label: SharedStr::from("same"), ratio: 2.5 },
        ];
        let mut s = Serializer::writing(&mut container);
        original.serialize(&mut s).unwrap();
        let bytes = s.into_bytes();

        // the shared label is interned once across the whole container
        let hits = bytes.windows(4).filter(|w| *w == b"same").count();
        assert_eq!(hits, 1);

        let mut restored: Vec<Sample> = Vec::new();
        let mut s = Serializer::reading(&mut container, &bytes);
        restored.serialize(&mut s).unwrap();

        assert_eq!(restored.len(), 3);
        for (r, o) in restored.iter().zip(&original) {
            assert_eq!(r.id, o.id);
            assert_eq!(r.label, o.label);
        }
    }

    #[test]
    fn test_vec_of_scalars_round_trip() {
        let mut container = DataPolicyContainer::standard();

        let mut original: Vec<u32> = vec![0, 1, 500, u32::MAX];
        let mut s = Serializer::writing(&mut container);
        original.serialize(&mut s).unwrap();
        let bytes = s.into_bytes();

        let mut restored: Vec<u32> = Vec::new();
        let mut s = Serializer::reading(&mut container, &bytes);
        restored.serialize(&mut s).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn test_truncated_input_unwinds_with_an_error() {
        let mut container = DataPolicyContainer::standard();

        let mut original = Sample {
            id: 900,
            label: SharedStr::from("will be cut"),
            ratio: 3.0,
        };
        let mut s = Serializer::writing(&mut container);
        original.serialize(&mut s).unwrap();
        let bytes = s.into_bytes();

        let truncated = &bytes[..bytes.len() / 2];
        let mut restored = Sample::default();
        let mut s = Serializer::reading(&mut container, truncated);
        assert!(restored.serialize(&mut s).is_err());
    }

    #[test]
    fn test_sessions_reset_policy_state() {
        let mut container = DataPolicyContainer::standard();
        let mut label = SharedStr::from("per_session");

        let mut s = Serializer::writing(&mut container);
        s.value_with(&mut label, "unique").unwrap();
        let first = s.into_bytes();

        // a fresh session must not backreference the previous one
        let mut s = Serializer::writing(&mut container);
        s.value_with(&mut label, "unique").unwrap();
        let second = s.into_bytes();

        assert_eq!(first, second);
    }
}
