use rustc_hash::FxHashMap;

use serialization::stream::{Serialize, Serializer};

use crate::object::InvokeContext;

/// The positional argument tuple of a remote method: each element is written (or
///  read back) in declared order with its own encoding.
pub trait InvokeArgs {
    fn serialize_args(&mut self, s: &mut Serializer) -> anyhow::Result<()>;
}

impl InvokeArgs for () {
    fn serialize_args(&mut self, _s: &mut Serializer) -> anyhow::Result<()> {
        Ok(())
    }
}

macro_rules! impl_invoke_args {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: Serialize),+> InvokeArgs for ($($name,)+) {
            fn serialize_args(&mut self, s: &mut Serializer) -> anyhow::Result<()> {
                $( self.$idx.serialize(s)?; )+
                Ok(())
            }
        }
    };
}

impl_invoke_args!(A: 0);
impl_invoke_args!(A: 0, B: 1);
impl_invoke_args!(A: 0, B: 1, C: 2);
impl_invoke_args!(A: 0, B: 1, C: 2, D: 3);
impl_invoke_args!(A: 0, B: 1, C: 2, D: 3, E: 4);
impl_invoke_args!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);

/// Deserializes an argument tuple from an incoming invocation; the usual first
///  line of a method thunk.
pub fn read_args<A: InvokeArgs + Default>(s: &mut Serializer) -> anyhow::Result<A> {
    let mut args = A::default();
    args.serialize_args(s)?;
    Ok(args)
}

pub type MethodThunk<O> = fn(&mut O, &mut Serializer, &mut InvokeContext) -> anyhow::Result<()>;

/// The per-class signature table: `"Class::Method"` to the thunk that
///  deserializes the arguments and calls the method.
///
/// Each invocable class builds its registry once in a startup function and keeps
///  it in a static. A miss is reported as `Ok(false)` so the object can fall back
///  to its superclass's registry.
pub struct MethodRegistry<O> {
    methods: FxHashMap<&'static str, MethodThunk<O>>,
}

impl<O> MethodRegistry<O> {
    pub fn new() -> MethodRegistry<O> {
        MethodRegistry {
            methods: FxHashMap::default(),
        }
    }

    pub fn register(&mut self, signature: &'static str, thunk: MethodThunk<O>) {
        self.methods.insert(signature, thunk);
    }

    pub fn dispatch(
        &self,
        object: &mut O,
        signature: &str,
        s: &mut Serializer,
        ctx: &mut InvokeContext,
    ) -> anyhow::Result<bool> {
        match self.methods.get(signature) {
            Some(thunk) => {
                thunk(object, s, ctx)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl<O> Default for MethodRegistry<O> {
    fn default() -> Self {
        MethodRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Outbox;
    use serialization::policy::DataPolicyContainer;
    use serialization::shared_str::SharedStr;

    #[derive(Default)]
    struct Target {
        sum: i64,
        last_label: SharedStr,
    }

    fn registry() -> MethodRegistry<Target> {
        let mut registry: MethodRegistry<Target> = MethodRegistry::new();
        registry.register("Target::Add", |target, s, _ctx| {
            let (a, b) = read_args::<(i64, i64)>(s)?;
            target.sum = a + b;
            Ok(())
        });
        registry.register("Target::Label", |target, s, _ctx| {
            let (label,) = read_args::<(SharedStr,)>(s)?;
            target.last_label = label;
            Ok(())
        });
        registry
    }

    fn encode_args<A: InvokeArgs>(container: &mut DataPolicyContainer, mut args: A) -> bytes::Bytes {
        let mut s = Serializer::writing(container);
        args.serialize_args(&mut s).unwrap();
        s.into_bytes()
    }

    #[test]
    fn test_dispatch_deserializes_positional_args() {
        let mut container = DataPolicyContainer::standard();
        let bytes = encode_args(&mut container, (40i64, 2i64));

        let registry = registry();
        let mut target = Target::default();
        let mut outbox = Outbox::new();
        let mut ctx = InvokeContext::new(None, &mut outbox);
        let mut s = Serializer::reading(&mut container, &bytes);

        assert!(registry.dispatch(&mut target, "Target::Add", &mut s, &mut ctx).unwrap());
        assert_eq!(target.sum, 42);
    }

    #[test]
    fn test_unknown_signature_reports_false() {
        let mut container = DataPolicyContainer::standard();
        let bytes = encode_args(&mut container, ());

        let registry = registry();
        let mut target = Target::default();
        let mut outbox = Outbox::new();
        let mut ctx = InvokeContext::new(None, &mut outbox);
        let mut s = Serializer::reading(&mut container, &bytes);

        assert!(!registry.dispatch(&mut target, "Target::Missing", &mut s, &mut ctx).unwrap());
    }

    #[test]
    fn test_malformed_args_are_an_error() {
        let mut container = DataPolicyContainer::standard();
        // only one of the two expected i64s
        let bytes = encode_args(&mut container, (7i64,));

        let registry = registry();
        let mut target = Target::default();
        let mut outbox = Outbox::new();
        let mut ctx = InvokeContext::new(None, &mut outbox);
        let mut s = Serializer::reading(&mut container, &bytes);

        assert!(registry.dispatch(&mut target, "Target::Add", &mut s, &mut ctx).is_err());
    }

    #[test]
    fn test_miss_falls_back_to_the_base_registry() {
        struct Derived {
            base: Target,
            touched: bool,
        }

        fn derived_registry() -> MethodRegistry<Derived> {
            let mut registry: MethodRegistry<Derived> = MethodRegistry::new();
            registry.register("Derived::Touch", |derived, _s, _ctx| {
                derived.touched = true;
                Ok(())
            });
            registry
        }

        // the dispatch pattern of a subclass: own table first, then the base's
        fn dispatch(
            derived: &mut Derived,
            signature: &str,
            s: &mut Serializer,
            ctx: &mut InvokeContext,
        ) -> anyhow::Result<bool> {
            if derived_registry().dispatch(derived, signature, s, ctx)? {
                return Ok(true);
            }
            registry().dispatch(&mut derived.base, signature, s, ctx)
        }

        let mut container = DataPolicyContainer::standard();
        let mut derived = Derived { base: Target::default(), touched: false };
        let mut outbox = Outbox::new();

        let bytes = encode_args(&mut container, (1i64, 2i64));
        let mut ctx = InvokeContext::new(None, &mut outbox);
        let mut s = Serializer::reading(&mut container, &bytes);
        assert!(dispatch(&mut derived, "Target::Add", &mut s, &mut ctx).unwrap());
        assert_eq!(derived.base.sum, 3);

        let bytes = encode_args(&mut container, ());
        let mut ctx = InvokeContext::new(None, &mut outbox);
        let mut s = Serializer::reading(&mut container, &bytes);
        assert!(dispatch(&mut derived, "Derived::Touch", &mut s, &mut ctx).unwrap());
        assert!(derived.touched);

        let bytes = encode_args(&mut container, ());
        let mut ctx = InvokeContext::new(None, &mut outbox);
        let mut s = Serializer::reading(&mut container, &bytes);
        assert!(!dispatch(&mut derived, "Nobody::Home", &mut s, &mut ctx).unwrap());
    }

    #[test]
    fn test_string_args_round_trip() {
        let mut container = DataPolicyContainer::standard();
        let bytes = encode_args(&mut container, (SharedStr::from("label text"),));

        let registry = registry();
        let mut target = Target::default();
        let mut outbox = Outbox::new();
        let mut ctx = InvokeContext::new(None, &mut outbox);
        let mut s = Serializer::reading(&mut container, &bytes);

        assert!(registry.dispatch(&mut target, "Target::Label", &mut s, &mut ctx).unwrap());
        assert_eq!(target.last_label, "label text");
    }
}
