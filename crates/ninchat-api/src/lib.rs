// ninchat-api: action schema loading and parameter validation.
//
// The schema is a JSON spec bundle in two documents: `paramtypes.json`
// maps parameter names to type names, and `actions.json` maps action names
// to parameter specs.  A parameter spec is either the shorthand `true` /
// `false` (required / optional, type looked up in paramtypes) or an object
// `{"type": ..., "optional": ...}`.
//
// Validation happens synchronously at the call site, before an action is
// ever queued; the session engine only sees well-formed actions.

use std::collections::HashMap;
use std::sync::OnceLock;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A malformed or unreadable spec bundle.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("spec bundle is not valid JSON: {0}")]
    Syntax(#[from] serde_json::Error),
    #[error("spec bundle is unreadable: {0}")]
    Io(#[from] std::io::Error),
    #[error("parameter {param:?} of action {action:?} has no declared type")]
    UnknownParamType { action: String, param: String },
}

/// An action rejected before queueing: unknown action, missing required
/// parameter, invalid parameter value, or unknown parameter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParameterError {
    #[error("\"action\" is missing or not a string")]
    MissingAction,
    #[error("unknown action {0:?}")]
    UnknownAction(String),
    #[error("{} is missing from {action:?} action", .param.name)]
    MissingParameter { action: String, param: Parameter },
    #[error("{} value is invalid in {action:?} action (expected {})", .param.name, .param.param_type)]
    InvalidParameter { action: String, param: Parameter },
    #[error("unknown parameter {param:?} in {action:?} action")]
    UnknownParameter { action: String, param: String },
}

// ---------------------------------------------------------------------------
// Validator interface
// ---------------------------------------------------------------------------

/// Checks an action before it is queued.  Supplied to the session engine at
/// construction; [`Schema`] is the stock implementation.
pub trait ValidateAction: Send + Sync {
    /// `params` is the full parameter map including `"action"` (and
    /// `"action_id"` when one has been assigned).
    fn validate_action(&self, params: &Map<String, Value>, payload: &[Bytes])
    -> Result<(), ParameterError>;

    /// Whether the action must carry an `action_id` even when the caller
    /// did not ask for a reply.
    fn requires_action_id(&self, action: &str) -> bool {
        let _ = action;
        false
    }
}

// ---------------------------------------------------------------------------
// Schema types
// ---------------------------------------------------------------------------

/// Description of one parameter of an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub param_type: String,
    pub required: bool,
}

/// Description of one action: its parameters by name.
#[derive(Debug, Clone)]
pub struct ActionSpec {
    pub name: String,
    pub params: HashMap<String, Parameter>,
}

/// The loaded spec bundle.
#[derive(Debug, Clone)]
pub struct Schema {
    actions: HashMap<String, ActionSpec>,
}

/// Raw per-parameter spec as it appears in `actions.json`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawParamSpec {
    Shorthand(bool),
    Full {
        #[serde(rename = "type")]
        param_type: Option<String>,
        #[serde(default)]
        optional: bool,
    },
}

impl Schema {
    /// Load a schema from the two spec bundle documents.
    pub fn from_json(paramtypes_json: &str, actions_json: &str) -> Result<Self, SchemaError> {
        let paramtypes: HashMap<String, String> = serde_json::from_str(paramtypes_json)?;
        let raw: HashMap<String, HashMap<String, RawParamSpec>> =
            serde_json::from_str(actions_json)?;

        let mut actions = HashMap::with_capacity(raw.len());
        for (action_name, raw_params) in raw {
            let mut params = HashMap::with_capacity(raw_params.len());
            for (param_name, spec) in raw_params {
                let (param_type, required) = match spec {
                    RawParamSpec::Shorthand(required) => {
                        let t = paramtypes.get(&param_name).cloned().ok_or_else(|| {
                            SchemaError::UnknownParamType {
                                action: action_name.clone(),
                                param: param_name.clone(),
                            }
                        })?;
                        (t, required)
                    }
                    RawParamSpec::Full { param_type, optional } => {
                        let t = match param_type {
                            Some(t) => t,
                            None => paramtypes.get(&param_name).cloned().ok_or_else(|| {
                                SchemaError::UnknownParamType {
                                    action: action_name.clone(),
                                    param: param_name.clone(),
                                }
                            })?,
                        };
                        (t, !optional)
                    }
                };
                params.insert(
                    param_name.clone(),
                    Parameter { name: param_name, param_type, required },
                );
            }
            actions.insert(action_name.clone(), ActionSpec { name: action_name, params });
        }

        Ok(Schema { actions })
    }

    /// Load a schema from spec bundle files on disk.
    pub fn from_files(
        paramtypes_path: impl AsRef<std::path::Path>,
        actions_path: impl AsRef<std::path::Path>,
    ) -> Result<Self, SchemaError> {
        let paramtypes = std::fs::read_to_string(paramtypes_path)?;
        let actions = std::fs::read_to_string(actions_path)?;
        Schema::from_json(&paramtypes, &actions)
    }

    /// The spec bundle shipped with this crate.
    pub fn builtin() -> &'static Schema {
        static BUILTIN: OnceLock<Schema> = OnceLock::new();
        BUILTIN.get_or_init(|| {
            Schema::from_json(
                include_str!("../spec/json/paramtypes.json"),
                include_str!("../spec/json/actions.json"),
            )
            .expect("embedded spec bundle is well-formed")
        })
    }

    pub fn action(&self, name: &str) -> Option<&ActionSpec> {
        self.actions.get(name)
    }

    /// Known action names, unordered.
    pub fn action_names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }
}

impl ValidateAction for Schema {
    fn validate_action(
        &self,
        params: &Map<String, Value>,
        _payload: &[Bytes],
    ) -> Result<(), ParameterError> {
        let name = params
            .get("action")
            .and_then(Value::as_str)
            .ok_or(ParameterError::MissingAction)?;
        let spec = self
            .actions
            .get(name)
            .ok_or_else(|| ParameterError::UnknownAction(name.to_owned()))?;

        for param in spec.params.values() {
            match params.get(&param.name) {
                None | Some(Value::Null) => {
                    if param.required {
                        return Err(ParameterError::MissingParameter {
                            action: name.to_owned(),
                            param: param.clone(),
                        });
                    }
                }
                Some(value) => {
                    if !check_type(&param.param_type, value) {
                        return Err(ParameterError::InvalidParameter {
                            action: name.to_owned(),
                            param: param.clone(),
                        });
                    }
                }
            }
        }

        for key in params.keys() {
            if key != "action" && !spec.params.contains_key(key) {
                return Err(ParameterError::UnknownParameter {
                    action: name.to_owned(),
                    param: key.clone(),
                });
            }
        }

        Ok(())
    }

    fn requires_action_id(&self, action: &str) -> bool {
        self.actions
            .get(action)
            .and_then(|spec| spec.params.get("action_id"))
            .is_some_and(|p| p.required)
    }
}

/// Check a value against a spec type name.  Unknown type names never match.
pub fn check_type(param_type: &str, value: &Value) -> bool {
    match param_type {
        "bool" => value.is_boolean(),
        "int" => value.is_i64() || value.is_u64(),
        "float" => value.is_number(),
        "string" => value.is_string(),
        "string array" => value
            .as_array()
            .is_some_and(|items| items.iter().all(Value::is_string)),
        "object" => value.is_object(),
        "time" => value.as_i64().is_some_and(|n| n >= 0) || value.is_u64(),
        _ => false,
    }
}
