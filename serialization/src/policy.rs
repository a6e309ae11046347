use std::marker::PhantomData;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::bit_stream::{BitStreamReader, BitStreamWriter};
use crate::metadata::Element;
use crate::quantization::UniformQuantization;
use crate::shared_str::SharedStr;

/// A named encoding strategy for one supported type.
///
/// Policies may carry per-session state (caches, dictionaries); `reset` is called
///  at the start of every encode/decode session.
pub trait DataPolicy<T> {
    fn read(&mut self, stream: &mut BitStreamReader) -> anyhow::Result<T>;
    fn write(&mut self, stream: &mut BitStreamWriter, value: &T);
    fn reset(&mut self) {}
}

/// Instantiates a policy class from its metadata attributes.
pub type PolicyCreator<T> = fn(&[Element]) -> Box<dyn DataPolicy<T>>;

/// The built-in encoding of a core type, used when no policy is named.
pub trait CoreValue: Sized + Default + Clone + 'static {
    fn read_default(stream: &mut BitStreamReader) -> anyhow::Result<Self>;
    fn write_default(&self, stream: &mut BitStreamWriter);
}

impl CoreValue for bool {
    fn read_default(stream: &mut BitStreamReader) -> anyhow::Result<bool> {
        stream.read_bool()
    }

    fn write_default(&self, stream: &mut BitStreamWriter) {
        stream.write_bool(*self);
    }
}

macro_rules! impl_core_unsigned {
    ($t:ty) => {
        impl CoreValue for $t {
            fn read_default(stream: &mut BitStreamReader) -> anyhow::Result<$t> {
                stream.read_unsigned()
            }

            fn write_default(&self, stream: &mut BitStreamWriter) {
                stream.write_unsigned(*self);
            }
        }
    };
}

impl_core_unsigned!(u8);
impl_core_unsigned!(u16);
impl_core_unsigned!(u32);
impl_core_unsigned!(u64);

macro_rules! impl_core_signed {
    ($t:ty) => {
        impl CoreValue for $t {
            fn read_default(stream: &mut BitStreamReader) -> anyhow::Result<$t> {
                stream.read_signed()
            }

            fn write_default(&self, stream: &mut BitStreamWriter) {
                stream.write_signed(*self);
            }
        }
    };
}

impl_core_signed!(i8);
impl_core_signed!(i16);
impl_core_signed!(i32);
impl_core_signed!(i64);

// Floats are always quantized by default: f32 onto 32 bits over the 16-bit integer
//  range (roughly 16 fractional bits for small magnitudes), f64 onto 64 bits over
//  the 32-bit integer range.
fn default_f32_quantization() -> UniformQuantization {
    UniformQuantization::new(i16::MIN as f64, i16::MAX as f64, 32)
}

fn default_f64_quantization() -> UniformQuantization {
    UniformQuantization::new(i32::MIN as f64, i32::MAX as f64, 64)
}

impl CoreValue for f32 {
    fn read_default(stream: &mut BitStreamReader) -> anyhow::Result<f32> {
        Ok(default_f32_quantization().read(stream)? as f32)
    }

    fn write_default(&self, stream: &mut BitStreamWriter) {
        default_f32_quantization().write(stream, *self as f64);
    }
}

impl CoreValue for f64 {
    fn read_default(stream: &mut BitStreamReader) -> anyhow::Result<f64> {
        default_f64_quantization().read(stream)
    }

    fn write_default(&self, stream: &mut BitStreamWriter) {
        default_f64_quantization().write(stream, *self);
    }
}

impl CoreValue for SharedStr {
    fn read_default(stream: &mut BitStreamReader) -> anyhow::Result<SharedStr> {
        stream.read_str()
    }

    fn write_default(&self, stream: &mut BitStreamWriter) {
        stream.write_str(self);
    }
}

impl CoreValue for Bytes {
    fn read_default(stream: &mut BitStreamReader) -> anyhow::Result<Bytes> {
        stream.read_buffer()
    }

    fn write_default(&self, stream: &mut BitStreamWriter) {
        stream.write_buffer(self);
    }
}

struct DefaultPolicy<T: CoreValue>(PhantomData<T>);

impl<T: CoreValue> DataPolicy<T> for DefaultPolicy<T> {
    fn read(&mut self, stream: &mut BitStreamReader) -> anyhow::Result<T> {
        T::read_default(stream)
    }

    fn write(&mut self, stream: &mut BitStreamWriter, value: &T) {
        value.write_default(stream);
    }
}

/// The per-type policy registry: creators by class name, instantiated policies by
///  policy name, aliases, and the always-present default.
pub struct PolicyNode<T> {
    creators: FxHashMap<SharedStr, PolicyCreator<T>>,
    policies: FxHashMap<SharedStr, Box<dyn DataPolicy<T>>>,
    aliases: FxHashMap<SharedStr, SharedStr>,
    elements: Vec<Element>,
    default: Box<dyn DataPolicy<T>>,
}

impl<T: CoreValue> PolicyNode<T> {
    fn new() -> PolicyNode<T> {
        PolicyNode {
            creators: FxHashMap::default(),
            policies: FxHashMap::default(),
            aliases: FxHashMap::default(),
            elements: Vec::new(),
            default: Box::new(DefaultPolicy(PhantomData)),
        }
    }

    pub fn register_creator(&mut self, class_name: &str, creator: PolicyCreator<T>) {
        self.creators.insert(SharedStr::from(class_name), creator);
    }

    /// Instantiates `policy` elements whose class is registered for this type and
    ///  records `alias` elements. Elements are remembered so a later `setup` can
    ///  replay them into a fresh container.
    pub fn load_policies(&mut self, elements: &[Element]) {
        for element in elements {
            if element.name == "policy" {
                let (Some(policy_name), Some(class_name)) =
                    (element.attribute("name"), element.attribute("class"))
                else {
                    continue;
                };
                if let Some(creator) = self.creators.get(class_name) {
                    debug!("instantiating data policy {} ({})", policy_name, class_name);
                    self.policies
                        .insert(SharedStr::from(policy_name), creator(&element.children));
                }
            } else if element.name == "alias" {
                let (Some(alias_name), Some(policy_name)) =
                    (element.attribute("name"), element.attribute("policy"))
                else {
                    continue;
                };
                if self.policies.contains_key(policy_name) {
                    self.aliases
                        .insert(SharedStr::from(alias_name), SharedStr::from(policy_name));
                }
            }
        }

        self.elements.extend_from_slice(elements);
    }

    pub fn reset_policies(&mut self) {
        for policy in self.policies.values_mut() {
            policy.reset();
        }
        self.default.reset();
    }

    /// Resolves a policy by name (through aliases); an empty or unknown name
    ///  yields the default policy.
    pub fn policy_mut(&mut self, name: &str) -> &mut dyn DataPolicy<T> {
        let key: &str = match self.aliases.get(name) {
            Some(actual) => actual.as_str(),
            None => name,
        };
        match self.policies.get_mut(key) {
            Some(policy) => policy.as_mut(),
            None => self.default.as_mut(),
        }
    }

    fn setup(&mut self, rhs: &PolicyNode<T>) {
        self.creators = rhs.creators.clone();
        self.load_policies(&rhs.elements);
    }
}

macro_rules! with_each_node {
    ($container:expr, $node:ident => $body:expr) => {{
        let $node = &mut $container.bools; $body;
        let $node = &mut $container.u8s; $body;
        let $node = &mut $container.i8s; $body;
        let $node = &mut $container.u16s; $body;
        let $node = &mut $container.i16s; $body;
        let $node = &mut $container.u32s; $body;
        let $node = &mut $container.i32s; $body;
        let $node = &mut $container.u64s; $body;
        let $node = &mut $container.i64s; $body;
        let $node = &mut $container.f32s; $body;
        let $node = &mut $container.f64s; $body;
        let $node = &mut $container.strings; $body;
        let $node = &mut $container.buffers; $body;
    }};
}

/// The closed enumeration of per-type policy registries, one node per supported
///  core type.
pub struct DataPolicyContainer {
    bools: PolicyNode<bool>,
    u8s: PolicyNode<u8>,
    i8s: PolicyNode<i8>,
    u16s: PolicyNode<u16>,
    i16s: PolicyNode<i16>,
    u32s: PolicyNode<u32>,
    i32s: PolicyNode<i32>,
    u64s: PolicyNode<u64>,
    i64s: PolicyNode<i64>,
    f32s: PolicyNode<f32>,
    f64s: PolicyNode<f64>,
    strings: PolicyNode<SharedStr>,
    buffers: PolicyNode<Bytes>,
}

impl DataPolicyContainer {
    pub fn new() -> DataPolicyContainer {
        DataPolicyContainer {
            bools: PolicyNode::new(),
            u8s: PolicyNode::new(),
            i8s: PolicyNode::new(),
            u16s: PolicyNode::new(),
            i16s: PolicyNode::new(),
            u32s: PolicyNode::new(),
            i32s: PolicyNode::new(),
            u64s: PolicyNode::new(),
            i64s: PolicyNode::new(),
            f32s: PolicyNode::new(),
            f64s: PolicyNode::new(),
            strings: PolicyNode::new(),
            buffers: PolicyNode::new(),
        }
    }

    /// A runtime container initialized from the standard preload.
    pub fn standard() -> DataPolicyContainer {
        let mut container = DataPolicyContainer::new();
        container.setup(&DataPolicyPreload::standard());
        container
    }

    pub fn register_creator<T: Policied>(&mut self, class_name: &str, creator: PolicyCreator<T>) {
        T::node_mut(self).register_creator(class_name, creator);
    }

    /// Offers the elements to every type node; each instantiates the policies
    ///  whose class is registered for it.
    pub fn load_policies(&mut self, elements: &[Element]) {
        with_each_node!(self, node => node.load_policies(elements));
    }

    /// Called at the start of every encode/decode session.
    pub fn reset_policies(&mut self) {
        with_each_node!(self, node => node.reset_policies());
    }

    /// Snapshots the preload registry: copies the creators and replays the
    ///  recorded policy elements into this container.
    pub fn setup(&mut self, preload: &DataPolicyPreload) {
        self.bools.setup(&preload.container.bools);
        self.u8s.setup(&preload.container.u8s);
        self.i8s.setup(&preload.container.i8s);
        self.u16s.setup(&preload.container.u16s);
        self.i16s.setup(&preload.container.i16s);
        self.u32s.setup(&preload.container.u32s);
        self.i32s.setup(&preload.container.i32s);
        self.u64s.setup(&preload.container.u64s);
        self.i64s.setup(&preload.container.i64s);
        self.f32s.setup(&preload.container.f32s);
        self.f64s.setup(&preload.container.f64s);
        self.strings.setup(&preload.container.strings);
        self.buffers.setup(&preload.container.buffers);
    }
}

impl Default for DataPolicyContainer {
    fn default() -> Self {
        DataPolicyContainer::new()
    }
}

/// A core type with its slot in the [`DataPolicyContainer`].
pub trait Policied: CoreValue {
    fn node_mut(container: &mut DataPolicyContainer) -> &mut PolicyNode<Self>;
}

macro_rules! impl_policied {
    ($t:ty, $field:ident) => {
        impl Policied for $t {
            fn node_mut(container: &mut DataPolicyContainer) -> &mut PolicyNode<$t> {
                &mut container.$field
            }
        }
    };
}

impl_policied!(bool, bools);
impl_policied!(u8, u8s);
impl_policied!(i8, i8s);
impl_policied!(u16, u16s);
impl_policied!(i16, i16s);
impl_policied!(u32, u32s);
impl_policied!(i32, i32s);
impl_policied!(u64, u64s);
impl_policied!(i64, i64s);
impl_policied!(f32, f32s);
impl_policied!(f64, f64s);
impl_policied!(SharedStr, strings);
impl_policied!(Bytes, buffers);

/// The startup-time policy registry. Built once when the process comes up (no
///  static-initializer tricks - registration is explicit), then snapshotted into
///  runtime containers with [`DataPolicyContainer::setup`].
pub struct DataPolicyPreload {
    container: DataPolicyContainer,
}

impl DataPolicyPreload {
    pub fn new() -> DataPolicyPreload {
        DataPolicyPreload {
            container: DataPolicyContainer::new(),
        }
    }

    /// The stock registry: the `unique` string policy plus the
    ///  metadata-configurable float quantization class.
    pub fn standard() -> DataPolicyPreload {
        let mut preload = DataPolicyPreload::new();
        crate::unique_string::register(&mut preload);
        preload.register_creator::<f32>("UniformQuantizationPolicy", create_quantized_f32);
        preload.register_creator::<f64>("UniformQuantizationPolicy", create_quantized_f64);
        preload
    }

    pub fn register_creator<T: Policied>(&mut self, class_name: &str, creator: PolicyCreator<T>) {
        self.container.register_creator(class_name, creator);
    }

    pub fn load_policies(&mut self, elements: &[Element]) {
        self.container.load_policies(elements);
    }
}

impl Default for DataPolicyPreload {
    fn default() -> Self {
        DataPolicyPreload::new()
    }
}

/// min/max/nbits from the first child element that carries any of them.
fn quantization_config(elements: &[Element], defaults: (f64, f64, usize)) -> (f64, f64, usize) {
    for element in elements {
        let mn = element.parse_attribute::<f64>("min");
        let mx = element.parse_attribute::<f64>("max");
        let nbits = element.parse_attribute::<usize>("nbits");
        if mn.is_some() || mx.is_some() || nbits.is_some() {
            return (
                mn.unwrap_or(defaults.0),
                mx.unwrap_or(defaults.1),
                nbits.unwrap_or(defaults.2),
            );
        }
    }
    defaults
}

struct QuantizedF32Policy {
    q: UniformQuantization,
}

impl DataPolicy<f32> for QuantizedF32Policy {
    fn read(&mut self, stream: &mut BitStreamReader) -> anyhow::Result<f32> {
        Ok(self.q.read(stream)? as f32)
    }

    fn write(&mut self, stream: &mut BitStreamWriter, value: &f32) {
        self.q.write(stream, *value as f64);
    }
}

fn create_quantized_f32(elements: &[Element]) -> Box<dyn DataPolicy<f32>> {
    let (mn, mx, nbits) =
        quantization_config(elements, (i16::MIN as f64, i16::MAX as f64, 32));
    Box::new(QuantizedF32Policy {
        q: UniformQuantization::new(mn, mx, nbits),
    })
}

struct QuantizedF64Policy {
    q: UniformQuantization,
}

impl DataPolicy<f64> for QuantizedF64Policy {
    fn read(&mut self, stream: &mut BitStreamReader) -> anyhow::Result<f64> {
        self.q.read(stream)
    }

    fn write(&mut self, stream: &mut BitStreamWriter, value: &f64) {
        self.q.write(stream, *value);
    }
}

fn create_quantized_f64(elements: &[Element]) -> Box<dyn DataPolicy<f64>> {
    let (mn, mx, nbits) =
        quantization_config(elements, (i32::MIN as f64, i32::MAX as f64, 64));
    Box::new(QuantizedF64Policy {
        q: UniformQuantization::new(mn, mx, nbits),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_round_trips_core_types() {
        let mut container = DataPolicyContainer::new();

        let mut writer = BitStreamWriter::new();
        bool::node_mut(&mut container).policy_mut("").write(&mut writer, &true);
        u32::node_mut(&mut container).policy_mut("").write(&mut writer, &77);
        i16::node_mut(&mut container).policy_mut("").write(&mut writer, &-500);
        SharedStr::node_mut(&mut container)
            .policy_mut("")
            .write(&mut writer, &SharedStr::from("name"));

        let bytes = writer.into_bytes();
        let mut reader = BitStreamReader::new(&bytes);
        assert!(bool::node_mut(&mut container).policy_mut("").read(&mut reader).unwrap());
        assert_eq!(u32::node_mut(&mut container).policy_mut("").read(&mut reader).unwrap(), 77);
        assert_eq!(i16::node_mut(&mut container).policy_mut("").read(&mut reader).unwrap(), -500);
        assert_eq!(
            SharedStr::node_mut(&mut container).policy_mut("").read(&mut reader).unwrap(),
            "name"
        );
    }

    #[test]
    fn test_unknown_policy_name_falls_back_to_default() {
        let mut container = DataPolicyContainer::new();
        let mut writer = BitStreamWriter::new();
        u8::node_mut(&mut container).policy_mut("no such policy").write(&mut writer, &9);

        let bytes = writer.into_bytes();
        let mut reader = BitStreamReader::new(&bytes);
        assert_eq!(u8::node_mut(&mut container).policy_mut("").read(&mut reader).unwrap(), 9);
    }

    #[test]
    fn test_metadata_configured_quantization_policy() {
        let mut container = DataPolicyContainer::standard();
        container.load_policies(&[Element::new("policy")
            .with_attribute("name", "coarse")
            .with_attribute("class", "UniformQuantizationPolicy")
            .with_child(
                Element::new("range")
                    .with_attribute("min", "-1")
                    .with_attribute("max", "1")
                    .with_attribute("nbits", "10"),
            )]);

        let mut writer = BitStreamWriter::new();
        f32::node_mut(&mut container).policy_mut("coarse").write(&mut writer, &0.5);
        assert_eq!(writer.bit_offset(), 10);

        let bytes = writer.into_bytes();
        let mut reader = BitStreamReader::new(&bytes);
        let restored = f32::node_mut(&mut container).policy_mut("coarse").read(&mut reader).unwrap();
        assert!((restored - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_alias_resolves_to_policy() {
        let mut container = DataPolicyContainer::standard();
        container.load_policies(&[Element::new("alias")
            .with_attribute("name", "interned")
            .with_attribute("policy", "unique")]);

        let mut writer = BitStreamWriter::new();
        let value = SharedStr::from("aliased");
        SharedStr::node_mut(&mut container).policy_mut("interned").write(&mut writer, &value);
        SharedStr::node_mut(&mut container).policy_mut("interned").write(&mut writer, &value);

        container.reset_policies();
        let bytes = writer.into_bytes();
        let mut reader = BitStreamReader::new(&bytes);
        assert_eq!(
            SharedStr::node_mut(&mut container).policy_mut("interned").read(&mut reader).unwrap(),
            "aliased"
        );
        assert_eq!(
            SharedStr::node_mut(&mut container).policy_mut("interned").read(&mut reader).unwrap(),
            "aliased"
        );
    }

    #[test]
    fn test_setup_snapshots_the_preload() {
        let mut preload = DataPolicyPreload::standard();
        preload.load_policies(&[Element::new("policy")
            .with_attribute("name", "tight")
            .with_attribute("class", "UniformQuantizationPolicy")
            .with_child(Element::new("range").with_attribute("nbits", "8"))]);

        let mut container = DataPolicyContainer::new();
        container.setup(&preload);

        let mut writer = BitStreamWriter::new();
        f64::node_mut(&mut container).policy_mut("tight").write(&mut writer, &0.0);
        assert_eq!(writer.bit_offset(), 8);
    }
}
