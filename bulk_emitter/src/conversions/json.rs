use std::{fmt, sync::Arc};

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Payload, SerializeError, Serializer};

/// A key/value pair appended to every serialized object.
///
/// Static properties are written as given. Dynamic ones hold a template whose
/// `${...}` placeholders are resolved for each payload; if any placeholder
/// cannot be resolved the property is left out. Existing keys of the payload
/// win over virtual properties with the same name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualProperty {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub dynamic: bool,
}

impl VirtualProperty {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        VirtualProperty {
            name: name.into(),
            value: value.into(),
            dynamic: false,
        }
    }

    pub fn dynamic(name: impl Into<String>, template: impl Into<String>) -> Self {
        VirtualProperty {
            dynamic: true,
            ..VirtualProperty::new(name, template)
        }
    }
}

/// Looks up the value of one `${key}` placeholder for a payload.
pub trait ValueResolver: Send + Sync {
    fn lookup(&self, key: &str, payload: &Payload) -> Option<String>;
}

/// Resolves `${ctx:name}` from the context map of an event, or from a
/// top-level string field of a structured payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextLookup;

impl ValueResolver for ContextLookup {
    fn lookup(&self, key: &str, payload: &Payload) -> Option<String> {
        let name = key.strip_prefix("ctx:")?;
        match payload {
            Payload::Event(event) => event.context.get(name).cloned(),
            Payload::Structured(Value::Object(object)) => {
                object.get(name)?.as_str().map(str::to_owned)
            }
            _ => None,
        }
    }
}

fn expand(template: &str, payload: &Payload, resolver: &dyn ValueResolver) -> Option<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}')?;
        out.push_str(&resolver.lookup(&after[..end], payload)?);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Some(out)
}

#[derive(Serialize)]
struct MessageRecord<'a> {
    message: &'a str,
}

#[derive(Clone)]
pub struct JsonSerializer {
    virtual_properties: Vec<VirtualProperty>,
    resolver: Arc<dyn ValueResolver>,
}

impl Default for JsonSerializer {
    fn default() -> Self {
        JsonSerializer::new(Vec::new())
    }
}

impl fmt::Debug for JsonSerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonSerializer")
            .field("virtual_properties", &self.virtual_properties)
            .finish_non_exhaustive()
    }
}

impl JsonSerializer {
    pub fn new(virtual_properties: Vec<VirtualProperty>) -> Self {
        JsonSerializer {
            virtual_properties,
            resolver: Arc::new(ContextLookup),
        }
    }

    /// Replaces the lookup used for dynamic virtual properties.
    pub fn with_resolver(mut self, resolver: Arc<dyn ValueResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    fn to_value(payload: &Payload) -> Result<Value, SerializeError> {
        Ok(match payload {
            Payload::Event(event) => serde_json::to_value(event)?,
            Payload::Message(message) => serde_json::to_value(MessageRecord { message })?,
            Payload::Structured(value) => value.clone(),
        })
    }

    fn append_virtual_properties(&self, payload: &Payload, object: &mut Map<String, Value>) {
        for property in &self.virtual_properties {
            if object.contains_key(&property.name) {
                continue;
            }
            let value = if property.dynamic {
                match expand(&property.value, payload, self.resolver.as_ref()) {
                    Some(value) => value,
                    None => continue,
                }
            } else {
                property.value.clone()
            };
            object.insert(property.name.clone(), Value::String(value));
        }
    }
}

impl Serializer for JsonSerializer {
    fn serialize_into(&self, payload: &Payload, buf: &mut BytesMut) -> Result<(), SerializeError> {
        let writer = buf.writer();

        if self.virtual_properties.is_empty() {
            match payload {
                Payload::Event(event) => serde_json::to_writer(writer, event)?,
                Payload::Message(message) => {
                    serde_json::to_writer(writer, &MessageRecord { message })?
                }
                Payload::Structured(value) => serde_json::to_writer(writer, value)?,
            }
            return Ok(());
        }

        let mut value = Self::to_value(payload)?;
        // non-object payloads (arrays, scalars) have nowhere to put the properties
        if let Value::Object(object) = &mut value {
            self.append_virtual_properties(payload, object);
        }
        serde_json::to_writer(writer, &value)?;

        Ok(())
    }
}
