use std::collections::HashSet;

/// How a struct with named fields goes on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StructSerializationStyle {
    /// As a D-Bus struct, `(...)`, with every field present.
    StronglyTyped,
    /// As `a{sv}`, keyed by field name. `None` fields are left out.
    Dict,
}

pub trait SerializerPolicy: Clone {
    fn query_struct_name(&self, name: &str) -> StructSerializationStyle;
}

/// A bare style is a policy that answers the same for every struct.
impl SerializerPolicy for StructSerializationStyle {
    fn query_struct_name(&self, _: &str) -> StructSerializationStyle {
        *self
    }
}

#[derive(Clone, Debug)]
pub struct DefaultSerializerPolicy;

impl SerializerPolicy for DefaultSerializerPolicy {
    fn query_struct_name(&self, _: &str) -> StructSerializationStyle {
        StructSerializationStyle::Dict
    }
}

#[derive(Clone, Debug)]
pub struct StronglyTypedSerializerPolicy;

impl SerializerPolicy for StronglyTypedSerializerPolicy {
    fn query_struct_name(&self, _: &str) -> StructSerializationStyle {
        StructSerializationStyle::StronglyTyped
    }
}

/// Dictionary style, except for the struct names listed here.
#[derive(Clone, Debug, Default)]
pub struct NamedStructPolicy {
    strongly_typed: HashSet<String>,
}

impl NamedStructPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strongly_typed(mut self, name: &str) -> Self {
        self.strongly_typed.insert(name.to_owned());
        self
    }
}

impl SerializerPolicy for NamedStructPolicy {
    fn query_struct_name(&self, name: &str) -> StructSerializationStyle {
        if self.strongly_typed.contains(name) {
            StructSerializationStyle::StronglyTyped
        } else {
            StructSerializationStyle::Dict
        }
    }
}
