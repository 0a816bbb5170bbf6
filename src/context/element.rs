//! Context Elements
//!
//! Typed, named data elements attached to an execution instance, and the
//! ordered stack that holds them.
//!
//! Elements are immutable once created. Pushing an element of a type that
//! is already on the stack shadows the older one for lookups without
//! removing it, which is how Fork and Repeat children scope their own
//! element on top of the inherited stack.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind of data an element carries.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    /// The target instance (host, container, service) a step acts on
    Instance,
    /// Standard workflow parameters (application, environment, artifact)
    StandardParams,
    /// Marker pushed onto a Fork child
    Fork,
    /// One element of a Repeat collection
    RepeatElement,
    /// Host-defined element type
    Custom(String),
}

impl ElementType {
    /// Parses a user-facing type name. Unknown names become `Custom`.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "instance" => Self::Instance,
            "standard_params" | "standard-params" | "params" => Self::StandardParams,
            "fork" => Self::Fork,
            "repeat_element" | "repeat-element" => Self::RepeatElement,
            other => Self::Custom(other.to_string()),
        }
    }

    /// Returns the type name as used in expressions and environment variables.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Instance => "instance",
            Self::StandardParams => "standard_params",
            Self::Fork => "fork",
            Self::RepeatElement => "repeat_element",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single named, typed piece of execution data.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ContextElement {
    id: String,
    element_type: ElementType,
    name: String,
    #[serde(default)]
    payload: Value,
}

impl ContextElement {
    /// Creates an element with a freshly generated id.
    pub fn new(element_type: ElementType, name: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            element_type,
            name: name.into(),
            payload,
        }
    }

    /// Creates an element from a collection value.
    ///
    /// Strings name themselves, objects use their `name` field when present,
    /// anything else is named by its JSON rendering.
    pub fn from_value(element_type: ElementType, value: Value) -> Self {
        let name = match &value {
            Value::String(s) => s.clone(),
            Value::Object(map) => match map.get("name") {
                Some(Value::String(s)) => s.clone(),
                _ => value.to_string(),
            },
            other => other.to_string(),
        };
        Self::new(element_type, name, value)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn element_type(&self) -> &ElementType {
        &self.element_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }
}

/// Ordered stack of context elements, most recent last.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct ContextStack {
    elements: Vec<ContextElement>,
}

impl ContextStack {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a stack seeded with the given elements, first pushed first.
    pub fn from_elements(elements: Vec<ContextElement>) -> Self {
        Self { elements }
    }

    /// Pushes an element on top of the stack.
    pub fn push(&mut self, element: ContextElement) {
        self.elements.push(element);
    }

    /// Returns the most recently pushed element of the given type.
    pub fn latest(&self, element_type: &ElementType) -> Option<&ContextElement> {
        self.elements
            .iter()
            .rev()
            .find(|e| e.element_type() == element_type)
    }

    /// Returns every element of the given type, most recent first.
    pub fn all_of(&self, element_type: &ElementType) -> Vec<&ContextElement> {
        self.elements
            .iter()
            .rev()
            .filter(|e| e.element_type() == element_type)
            .collect()
    }

    /// Returns the most recently pushed element with the given name.
    pub fn find_by_name(&self, name: &str) -> Option<&ContextElement> {
        self.elements.iter().rev().find(|e| e.name() == name)
    }

    /// Returns the top of the stack.
    pub fn top(&self) -> Option<&ContextElement> {
        self.elements.last()
    }

    /// Iterates from the bottom of the stack to the top.
    pub fn iter(&self) -> impl Iterator<Item = &ContextElement> {
        self.elements.iter()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_push_shadows_without_removing() {
        let mut stack = ContextStack::new();
        stack.push(ContextElement::new(ElementType::Instance, "host-1", Value::Null));
        stack.push(ContextElement::new(ElementType::StandardParams, "params", json!({"env": "prod"})));
        stack.push(ContextElement::new(ElementType::Instance, "host-2", Value::Null));

        assert_eq!(stack.len(), 3);
        assert_eq!(stack.latest(&ElementType::Instance).unwrap().name(), "host-2");
        assert_eq!(stack.all_of(&ElementType::Instance).len(), 2);
        assert_eq!(stack.latest(&ElementType::StandardParams).unwrap().payload()["env"], "prod");
    }

    #[test]
    fn test_lookup_missing_type() {
        let stack = ContextStack::new();
        assert!(stack.latest(&ElementType::Fork).is_none());
        assert!(stack.top().is_none());
    }

    #[test]
    fn test_from_value_naming() {
        let by_string = ContextElement::from_value(ElementType::Instance, json!("web-1"));
        assert_eq!(by_string.name(), "web-1");

        let by_object = ContextElement::from_value(ElementType::Instance, json!({"name": "db-1", "port": 5432}));
        assert_eq!(by_object.name(), "db-1");
        assert_eq!(by_object.payload()["port"], 5432);

        let by_number = ContextElement::from_value(ElementType::RepeatElement, json!(7));
        assert_eq!(by_number.name(), "7");
    }

    #[test]
    fn test_element_ids_are_unique() {
        let a = ContextElement::new(ElementType::Fork, "Fork1", Value::Null);
        let b = ContextElement::new(ElementType::Fork, "Fork1", Value::Null);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_element_type_parse() {
        assert_eq!(ElementType::parse("Instance"), ElementType::Instance);
        assert_eq!(ElementType::parse("params"), ElementType::StandardParams);
        assert_eq!(ElementType::parse("region"), ElementType::Custom("region".to_string()));
        assert_eq!(ElementType::parse("region").as_str(), "region");
    }

    #[test]
    fn test_stack_serializes_as_list() {
        let mut stack = ContextStack::new();
        stack.push(ContextElement::new(ElementType::Instance, "host-1", Value::Null));

        let json = serde_json::to_value(&stack).unwrap();
        assert!(json.is_array());
        let restored: ContextStack = serde_json::from_value(json).unwrap();
        assert_eq!(restored, stack);
    }
}
