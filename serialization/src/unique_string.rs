use rustc_hash::FxHashMap;

use crate::bit_stream::{BitStreamReader, BitStreamWriter};
use crate::metadata::Element;
use crate::policy::{DataPolicy, DataPolicyPreload};
use crate::shared_str::SharedStr;

/// Suppresses repeated strings within one encode session.
///
/// The first occurrence is written inline (flag bit `false`, then the string) and
///  its bit offset remembered; every later occurrence writes flag bit `true` plus
///  a u32 backreference to that offset. The decoder keeps the inverse map, and for
///  a backreference it has not resolved yet it seeks to the referenced offset,
///  reads the string there and restores the cursor.
///
/// Method signatures and meta-struct field names go through this policy, which is
///  what keeps repeated identifiers cheap on the wire.
pub struct UniqueStringPolicy {
    read_cache: FxHashMap<usize, SharedStr>,
    write_cache: FxHashMap<SharedStr, usize>,
}

impl UniqueStringPolicy {
    pub fn new() -> UniqueStringPolicy {
        UniqueStringPolicy {
            read_cache: FxHashMap::default(),
            write_cache: FxHashMap::default(),
        }
    }
}

impl Default for UniqueStringPolicy {
    fn default() -> Self {
        UniqueStringPolicy::new()
    }
}

impl DataPolicy<SharedStr> for UniqueStringPolicy {
    fn read(&mut self, stream: &mut BitStreamReader) -> anyhow::Result<SharedStr> {
        let cached = stream.read_bool()?;
        if cached {
            let offset = stream.read_unsigned::<u32>()? as usize;
            if let Some(value) = self.read_cache.get(&offset) {
                return Ok(value.clone());
            }

            // a backreference into stream territory this session has not decoded:
            //  re-materialize the string in place and restore the cursor
            let saved = stream.bit_offset();
            stream.set_bit_offset(offset);
            let result = stream.read_str();
            stream.set_bit_offset(saved);

            let value = result?;
            self.read_cache.insert(offset, value.clone());
            Ok(value)
        } else {
            let offset = stream.bit_offset();
            let value = stream.read_str()?;
            self.read_cache.insert(offset, value.clone());
            Ok(value)
        }
    }

    fn write(&mut self, stream: &mut BitStreamWriter, value: &SharedStr) {
        match self.write_cache.get(value) {
            Some(&offset) => {
                stream.write_bool(true);
                stream.write_unsigned(offset as u32);
            }
            None => {
                stream.write_bool(false);
                self.write_cache.insert(value.clone(), stream.bit_offset());
                stream.write_str(value);
            }
        }
    }

    fn reset(&mut self) {
        self.read_cache.clear();
        self.write_cache.clear();
    }
}

fn create(_elements: &[Element]) -> Box<dyn DataPolicy<SharedStr>> {
    Box::new(UniqueStringPolicy::new())
}

/// Registers the policy class and defines the `unique` policy name.
pub fn register(preload: &mut DataPolicyPreload) {
    preload.register_creator::<SharedStr>("UniqueStringPolicy", create);
    preload.load_policies(&[Element::new("policy")
        .with_attribute("name", "unique")
        .with_attribute("class", "UniqueStringPolicy")]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
        haystack.windows(needle.len()).filter(|w| *w == needle).count()
    }

    #[test]
    fn test_repeated_string_appears_once_on_the_wire() {
        let mut policy = UniqueStringPolicy::new();
        let name = SharedStr::from("dest_province_id");

        let mut writer = BitStreamWriter::new();
        for _ in 0..5 {
            policy.write(&mut writer, &name);
        }

        let bytes = writer.into_bytes();
        assert_eq!(count_occurrences(&bytes, b"dest_province_id"), 1);

        policy.reset();
        let mut reader = BitStreamReader::new(&bytes);
        for _ in 0..5 {
            assert_eq!(policy.read(&mut reader).unwrap(), "dest_province_id");
        }
    }

    #[test]
    fn test_distinct_strings_are_each_written_inline() {
        let mut policy = UniqueStringPolicy::new();
        let a = SharedStr::from("alpha");
        let b = SharedStr::from("beta");

        let mut writer = BitStreamWriter::new();
        policy.write(&mut writer, &a);
        policy.write(&mut writer, &b);
        policy.write(&mut writer, &a);
        policy.write(&mut writer, &b);

        let bytes = writer.into_bytes();
        assert_eq!(count_occurrences(&bytes, b"alpha"), 1);
        assert_eq!(count_occurrences(&bytes, b"beta"), 1);

        policy.reset();
        let mut reader = BitStreamReader::new(&bytes);
        assert_eq!(policy.read(&mut reader).unwrap(), "alpha");
        assert_eq!(policy.read(&mut reader).unwrap(), "beta");
        assert_eq!(policy.read(&mut reader).unwrap(), "alpha");
        assert_eq!(policy.read(&mut reader).unwrap(), "beta");
    }

    #[test]
    fn test_reset_starts_a_fresh_dictionary() {
        let mut policy = UniqueStringPolicy::new();
        let name = SharedStr::from("again");

        let mut writer = BitStreamWriter::new();
        policy.write(&mut writer, &name);
        policy.reset();
        policy.write(&mut writer, &name);

        let bytes = writer.into_bytes();
        assert_eq!(count_occurrences(&bytes, b"again"), 2);
    }

    #[test]
    fn test_cursor_is_restored_after_a_seek() {
        // decode only the second occurrence's surroundings: the read cache is cold,
        //  so the backreference forces a seek, which must not disturb what follows
        let mut policy = UniqueStringPolicy::new();
        let name = SharedStr::from("seek_target");

        let mut writer = BitStreamWriter::new();
        policy.write(&mut writer, &name);
        policy.write(&mut writer, &name);
        writer.write_unsigned(42u8);
        let bytes = writer.into_bytes();

        policy.reset();
        let mut reader = BitStreamReader::new(&bytes);
        assert_eq!(policy.read(&mut reader).unwrap(), "seek_target");
        // drop the cache to force the seek path on the backreference
        policy.read_cache.clear();
        assert_eq!(policy.read(&mut reader).unwrap(), "seek_target");
        assert_eq!(reader.read_unsigned::<u8>().unwrap(), 42);
    }
}
