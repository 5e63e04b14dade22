//! Type registry - maps command type tags to command shapes

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::CommandError;

/// Trait that all commands implement.
///
/// `TYPE` is the stable tag the command is routed by. It must be unique per
/// command shape within a process; a blank tag marks the command as untagged
/// and it is rejected before dispatch.
pub trait Command: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;
}

type DecodeFn = fn(Value) -> Result<Box<dyn Any + Send>, serde_json::Error>;

/// Registered shape of a command type
#[derive(Clone)]
pub struct ShapeDescriptor {
    tag: &'static str,
    type_id: TypeId,
    type_name: &'static str,
    decode: DecodeFn,
}

impl ShapeDescriptor {
    /// Descriptor for the command type `C`
    pub fn of<C: Command>() -> Self {
        Self {
            tag: C::TYPE,
            type_id: TypeId::of::<C>(),
            type_name: type_name::<C>(),
            decode: decode_as::<C>,
        }
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<C: Command>(&self) -> bool {
        self.type_id == TypeId::of::<C>()
    }

    /// Materialize a decoded payload as the concrete command
    pub fn decode(&self, value: Value) -> Result<Box<dyn Any + Send>, serde_json::Error> {
        (self.decode)(value)
    }
}

impl fmt::Debug for ShapeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShapeDescriptor")
            .field("tag", &self.tag)
            .field("type_name", &self.type_name)
            .finish()
    }
}

fn decode_as<C: Command>(value: Value) -> Result<Box<dyn Any + Send>, serde_json::Error> {
    let command: C = serde_json::from_value(value)?;
    Ok(Box::new(command))
}

/// Tag of `C`, rejecting untagged command shapes
pub fn tag_of<C: Command>() -> Result<&'static str, CommandError> {
    let tag = C::TYPE.trim();
    if tag.is_empty() {
        return Err(CommandError::UntaggedCommand(type_name::<C>().to_string()));
    }
    Ok(tag)
}

/// Process-wide table of known command shapes
#[derive(Default)]
pub struct TypeRegistry {
    shapes: RwLock<HashMap<String, ShapeDescriptor>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `shape` to its tag
    ///
    /// Registering the same shape again is a no-op; binding the tag to a
    /// different shape fails with `DuplicateType`.
    pub fn register(&self, shape: ShapeDescriptor) -> Result<(), CommandError> {
        let tag = shape.tag.trim();
        if tag.is_empty() {
            return Err(CommandError::UntaggedCommand(shape.type_name.to_string()));
        }

        let mut shapes = self.shapes.write();
        if let Some(existing) = shapes.get(tag) {
            if existing.type_id == shape.type_id {
                return Ok(());
            }
            return Err(CommandError::DuplicateType {
                tag: tag.to_string(),
                existing: existing.type_name.to_string(),
            });
        }

        debug!("Registered command type `{}` as {}", tag, shape.type_name);
        shapes.insert(tag.to_string(), shape);
        Ok(())
    }

    /// Register the shape of `C`
    pub fn register_command<C: Command>(&self) -> Result<(), CommandError> {
        self.register(ShapeDescriptor::of::<C>())
    }

    /// Look up the shape bound to `tag`
    pub fn resolve(&self, tag: &str) -> Result<ShapeDescriptor, CommandError> {
        self.shapes
            .read()
            .get(tag)
            .cloned()
            .ok_or_else(|| CommandError::UnknownType(tag.to_string()))
    }

    /// Tag of a command instance; fails if the shape is untagged
    pub fn tag_of<C: Command>(&self, _command: &C) -> Result<&'static str, CommandError> {
        tag_of::<C>()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.shapes.read().contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.shapes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
