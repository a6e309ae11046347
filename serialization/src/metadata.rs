use std::str::FromStr;

use rustc_hash::FxHashMap;

use crate::shared_str::SharedStr;

/// A node of structured policy metadata.
///
/// This is the format-agnostic shape policy definitions arrive in - whether they
///  were written out in code or loaded from a configuration source:
///
/// * `policy` elements (`name`, `class` attributes) instantiate a registered
///   policy class under a policy name, with the element's children as the
///   constructor attributes
/// * `alias` elements (`name`, `policy` attributes) add a second name for an
///   existing policy
#[derive(Clone, Debug, Default)]
pub struct Element {
    pub name: SharedStr,
    pub attributes: FxHashMap<SharedStr, SharedStr>,
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(name: &str) -> Element {
        Element {
            name: SharedStr::from(name),
            attributes: FxHashMap::default(),
            children: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: &str) -> Element {
        self.attributes.insert(SharedStr::from(key), SharedStr::from(value));
        self
    }

    pub fn with_child(mut self, child: Element) -> Element {
        self.children.push(child);
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|v| v.as_str())
    }

    pub fn parse_attribute<T: FromStr>(&self, key: &str) -> Option<T> {
        self.attribute(key)?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_accessors() {
        let element = Element::new("policy")
            .with_attribute("name", "pos")
            .with_attribute("class", "UniformQuantizationPolicy")
            .with_child(Element::new("range").with_attribute("min", "-1").with_attribute("nbits", "10"));

        assert_eq!(element.attribute("name"), Some("pos"));
        assert_eq!(element.attribute("missing"), None);
        assert_eq!(element.children[0].parse_attribute::<f64>("min"), Some(-1.0));
        assert_eq!(element.children[0].parse_attribute::<usize>("nbits"), Some(10));
        assert_eq!(element.children[0].parse_attribute::<usize>("min"), None);
    }
}
