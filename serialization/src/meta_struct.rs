use rustc_hash::FxHashMap;

use crate::shared_str::SharedStr;
use crate::stream::{Serialize, Serializer};
use crate::variant::Value;

/// A named slot in a [`MetaStruct`]. The name goes through the `unique` policy, so
///  a field name repeated across many structs in one session costs a backreference
///  after its first occurrence.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Field {
    name: SharedStr,
    value: Option<Value>,
}

impl Field {
    pub fn new(name: &str) -> Field {
        Field {
            name: SharedStr::from(name),
            value: None,
        }
    }

    pub fn name(&self) -> &SharedStr {
        &self.name
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn set_value(&mut self, value: Value) {
        self.value = Some(value);
    }
}

impl Serialize for Field {
    fn serialize(&mut self, s: &mut Serializer) -> anyhow::Result<()> {
        s.value_with(&mut self.name, "unique")?;

        let mut has_value = self.value.is_some();
        s.value(&mut has_value)?;

        if s.is_reading() {
            if has_value {
                let mut value = Value::default();
                value.serialize(s)?;
                self.value = Some(value);
            } else {
                self.value = None;
            }
        } else if let Some(value) = &mut self.value {
            value.serialize(s)?;
        }
        Ok(())
    }
}

/// A recursive schema-less record: a name and an ordered list of fields, with a
///  name-to-index map for lookup. Field values are [`Value`]s, which may
///  themselves be structs or arrays.
#[derive(Clone, Debug, Default)]
pub struct MetaStruct {
    name: SharedStr,
    fields: Vec<Field>,
    index: FxHashMap<SharedStr, usize>,
}

impl PartialEq for MetaStruct {
    fn eq(&self, other: &Self) -> bool {
        // the index map is derived from the fields
        self.name == other.name && self.fields == other.fields
    }
}

impl MetaStruct {
    pub fn new(name: &str) -> MetaStruct {
        MetaStruct {
            name: SharedStr::from(name),
            fields: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    pub fn name(&self) -> &SharedStr {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = SharedStr::from(name);
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.index.get(name).map(|&i| &self.fields[i])
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut Field> {
        let i = *self.index.get(name)?;
        Some(&mut self.fields[i])
    }

    /// Returns the existing field of that name, or appends a new one.
    pub fn add_field(&mut self, name: &str) -> &mut Field {
        let i = match self.index.get(name) {
            Some(&i) => i,
            None => {
                self.fields.push(Field::new(name));
                let i = self.fields.len() - 1;
                self.index.insert(SharedStr::from(name), i);
                i
            }
        };
        &mut self.fields[i]
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (i, field) in self.fields.iter().enumerate() {
            self.index.insert(field.name().clone(), i);
        }
    }
}

impl Serialize for MetaStruct {
    fn serialize(&mut self, s: &mut Serializer) -> anyhow::Result<()> {
        s.value_with(&mut self.name, "unique")?;
        self.fields.serialize(s)?;

        if s.is_reading() {
            self.rebuild_index();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::DataPolicyContainer;

    fn round_trip(original: &mut MetaStruct) -> MetaStruct {
        let mut container = DataPolicyContainer::standard();
        let mut s = Serializer::writing(&mut container);
        original.serialize(&mut s).unwrap();
        let bytes = s.into_bytes();

        let mut restored = MetaStruct::default();
        let mut s = Serializer::reading(&mut container, &bytes);
        restored.serialize(&mut s).unwrap();
        restored
    }

    #[test]
    fn test_flat_struct_round_trip() {
        let mut original = MetaStruct::new("order");
        original.add_field("id").set_value(Value::U64(9001));
        original.add_field("open").set_value(Value::Bool(true));
        original.add_field("note").set_value(Value::Str(SharedStr::from("rush")));
        original.add_field("unset"); // field without a value

        let restored = round_trip(&mut original);
        assert_eq!(restored, original);
        assert_eq!(restored.field("id").and_then(|f| f.value()), Some(&Value::U64(9001)));
        assert_eq!(
            restored.field("note").and_then(|f| f.value()).and_then(Value::as_str).map(|s| s.as_str()),
            Some("rush")
        );
        assert!(!restored.field("unset").unwrap().has_value());
    }

    #[test]
    fn test_nested_struct_and_array_round_trip() {
        let mut inner = MetaStruct::new("pos");
        inner.add_field("x").set_value(Value::I32(3));
        inner.add_field("y").set_value(Value::I32(-4));

        let mut original = MetaStruct::new("entity");
        original.add_field("pos").set_value(Value::Struct(Box::new(inner)));
        original.add_field("tags").set_value(Value::Array(vec![
            Value::Str(SharedStr::from("hostile")),
            Value::Str(SharedStr::from("fast")),
        ]));

        let restored = round_trip(&mut original);
        assert_eq!(restored, original);

        let pos = restored.field("pos").and_then(|f| f.value()).and_then(Value::as_struct).unwrap();
        assert_eq!(pos.field("y").and_then(|f| f.value()), Some(&Value::I32(-4)));
    }

    #[test]
    fn test_lookup_works_after_decode() {
        let mut original = MetaStruct::new("lookup");
        original.add_field("a").set_value(Value::U8(1));
        original.add_field("b").set_value(Value::U8(2));

        let restored = round_trip(&mut original);
        assert!(restored.has_field("a"));
        assert!(restored.has_field("b"));
        assert!(!restored.has_field("c"));
        assert_eq!(restored.field("b").and_then(|f| f.value()), Some(&Value::U8(2)));
    }

    #[test]
    fn test_repeated_field_name_is_interned() {
        // five structs in one array, all carrying the same field name: the name's
        //  bytes may appear only once in the whole stream
        let mut rows = Vec::new();
        for i in 0..5u32 {
            let mut row = MetaStruct::new("row");
            row.add_field("dest_province_id").set_value(Value::U32(i));
            rows.push(Value::Struct(Box::new(row)));
        }
        let mut original = MetaStruct::new("table");
        original.add_field("rows").set_value(Value::Array(rows));

        let mut container = DataPolicyContainer::standard();
        let mut s = Serializer::writing(&mut container);
        original.serialize(&mut s).unwrap();
        let bytes = s.into_bytes();

        let occurrences = bytes
            .windows(b"dest_province_id".len())
            .filter(|w| *w == b"dest_province_id")
            .count();
        assert_eq!(occurrences, 1);

        let mut restored = MetaStruct::default();
        let mut s = Serializer::reading(&mut container, &bytes);
        restored.serialize(&mut s).unwrap();
        assert_eq!(restored, original);

        let rows = restored.field("rows").and_then(|f| f.value()).and_then(Value::as_array).unwrap();
        assert_eq!(rows.len(), 5);
        for (i, row) in rows.iter().enumerate() {
            let row = row.as_struct().unwrap();
            assert_eq!(
                row.field("dest_province_id").and_then(|f| f.value()),
                Some(&Value::U32(i as u32))
            );
        }
    }

    #[test]
    fn test_add_field_is_idempotent() {
        let mut m = MetaStruct::new("idem");
        m.add_field("twice").set_value(Value::U8(1));
        m.add_field("twice").set_value(Value::U8(2));
        assert_eq!(m.fields().len(), 1);
        assert_eq!(m.field("twice").and_then(|f| f.value()), Some(&Value::U8(2)));
    }
}
