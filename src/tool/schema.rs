//! JSON-Schema (draft 2020-12) generation for tool input contracts.
//!
//! The generator consumes explicit parameter descriptors; how a host
//! discovers its callables and produces those descriptors is host-specific
//! and out of scope. Properties are required by default; a parameter must be
//! explicitly marked optional to be left out of `required`.

use serde_json::{json, Map, Value};

/// Identifier of the draft 2020-12 meta-schema.
pub const SCHEMA_DRAFT: &str = "https://json-schema.org/draft/2020-12/schema";

/// Options customizing the generated schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaOption {
    /// Allow argument objects to carry keys not defined in the schema.
    AllowAdditionalProperties,
    /// Emit `"type": "STRING"` style upper-cased type values (some model
    /// providers want them that way).
    UpperCaseTypeValues,
}

/// Describes one formal parameter of a tool callable.
#[derive(Debug, Clone)]
pub struct ToolParam {
    pub name: String,
    pub description: Option<String>,
    pub required: bool,
    /// JSON Schema of the parameter type
    pub schema: Value,
    /// A tool-context parameter is the per-invocation side channel: it is
    /// excluded from the generated schema and injected at call time.
    pub context: bool,
}

impl ToolParam {
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            description: None,
            required: true,
            schema,
            context: false,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, json!({"type": "string"}))
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, json!({"type": "number"}))
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, json!({"type": "integer"}))
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, json!({"type": "boolean"}))
    }

    /// The reserved tool-context parameter.
    pub fn context() -> Self {
        Self {
            name: "toolContext".to_string(),
            description: None,
            required: false,
            schema: Value::Null,
            context: true,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Builds the root object schema for a tool's parameter list.
pub fn build_input_schema(params: &[ToolParam], options: &[SchemaOption]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    let mut defs = Map::new();

    for param in params {
        if param.context {
            continue;
        }
        let mut schema = param.schema.clone();
        if let Some(object) = schema.as_object_mut() {
            // Nested definitions are hoisted to the root under plain keys.
            if let Some(Value::Object(nested)) = object.remove("$defs") {
                for (key, value) in nested {
                    defs.insert(key, value);
                }
            }
            if let Some(description) = &param.description {
                object.insert("description".to_string(), json!(description));
            }
        }
        if param.required {
            required.push(param.name.clone());
        }
        properties.insert(param.name.clone(), schema);
    }

    let mut schema = Map::new();
    schema.insert("$schema".to_string(), json!(SCHEMA_DRAFT));
    schema.insert("type".to_string(), json!("object"));
    schema.insert("properties".to_string(), Value::Object(properties));
    schema.insert("required".to_string(), json!(required));
    if !defs.is_empty() {
        schema.insert("$defs".to_string(), Value::Object(defs));
    }
    if !options.contains(&SchemaOption::AllowAdditionalProperties) {
        schema.insert("additionalProperties".to_string(), json!(false));
    }

    let mut schema = Value::Object(schema);
    if options.contains(&SchemaOption::UpperCaseTypeValues) {
        upper_case_type_values(&mut schema);
    }
    schema
}

/// Recursively upper-cases every `type` value, descending into
/// `properties`, `items`, and `$defs`.
pub fn upper_case_type_values(node: &mut Value) {
    let Some(object) = node.as_object_mut() else {
        return;
    };
    if let Some(Value::String(type_value)) = object.get_mut("type") {
        *type_value = type_value.to_uppercase();
    }
    for key in ["properties", "$defs"] {
        if let Some(Value::Object(children)) = object.get_mut(key) {
            for child in children.values_mut() {
                upper_case_type_values(child);
            }
        }
    }
    if let Some(items) = object.get_mut("items") {
        upper_case_type_values(items);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_schema_shape() {
        let schema = build_input_schema(
            &[
                ToolParam::string("city").description("City name"),
                ToolParam::integer("days").optional(),
            ],
            &[],
        );
        assert_eq!(schema["$schema"], SCHEMA_DRAFT);
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["city"]["type"], "string");
        assert_eq!(schema["properties"]["city"]["description"], "City name");
        assert_eq!(schema["properties"]["days"]["type"], "integer");
        assert_eq!(schema["required"], json!(["city"]));
        assert_eq!(schema["additionalProperties"], false);
    }

    #[test]
    fn context_parameter_is_excluded() {
        let schema = build_input_schema(
            &[ToolParam::context(), ToolParam::string("msg")],
            &[],
        );
        let properties = schema["properties"].as_object().unwrap();
        assert_eq!(properties.len(), 1);
        assert!(properties.contains_key("msg"));
        assert_eq!(schema["required"], json!(["msg"]));
    }

    #[test]
    fn nested_defs_are_hoisted() {
        let param = ToolParam::new(
            "location",
            json!({
                "$ref": "#/$defs/Location",
                "$defs": {
                    "Location": {
                        "type": "object",
                        "properties": {"lat": {"type": "number"}}
                    }
                }
            }),
        );
        let schema = build_input_schema(&[param], &[]);
        assert!(schema["$defs"]["Location"].is_object());
        assert!(schema["properties"]["location"].get("$defs").is_none());
    }

    #[test]
    fn additional_properties_can_be_allowed() {
        let schema = build_input_schema(
            &[ToolParam::string("q")],
            &[SchemaOption::AllowAdditionalProperties],
        );
        assert!(schema.get("additionalProperties").is_none());
    }

    #[test]
    fn upper_case_option_recurses() {
        let param = ToolParam::new(
            "filters",
            json!({
                "type": "array",
                "items": {"type": "string"}
            }),
        );
        let schema = build_input_schema(
            &[param, ToolParam::string("q")],
            &[SchemaOption::UpperCaseTypeValues],
        );
        assert_eq!(schema["type"], "OBJECT");
        assert_eq!(schema["properties"]["q"]["type"], "STRING");
        assert_eq!(schema["properties"]["filters"]["type"], "ARRAY");
        assert_eq!(schema["properties"]["filters"]["items"]["type"], "STRING");
    }
}
