//! Browser tool registry.
//!
//! Every REST-exposed tool is declared here with its parameter schema;
//! validation is total over the declared kinds, so a request that passes
//! `validate` translates directly into an IPC command.

use crate::error::FieldError;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Int,
    Bool,
    Number,
    Enum(&'static [&'static str]),
}

impl ParamKind {
    fn type_name(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Int => "int",
            ParamKind::Bool => "bool",
            ParamKind::Number => "number",
            ParamKind::Enum(_) => "enum",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub description: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct ToolDef {
    pub name: &'static str,
    pub description: &'static str,
    pub params: &'static [ParamSpec],
}

const CONTEXT_ID: ParamSpec = ParamSpec {
    name: "context_id",
    kind: ParamKind::String,
    required: false,
    description: "Browser context id; omitted means the default context",
};

const SELECTOR: ParamSpec = ParamSpec {
    name: "selector",
    kind: ParamKind::String,
    required: true,
    description: "CSS selector of the target element",
};

/// Every tool the gateway exposes under `POST /execute/{tool}`. The tool
/// name doubles as the IPC method name.
pub const TOOLS: &[ToolDef] = &[
    ToolDef {
        name: "createContext",
        description: "Create an isolated browser context",
        params: &[
            ParamSpec {
                name: "width",
                kind: ParamKind::Int,
                required: false,
                description: "Viewport width in pixels",
            },
            ParamSpec {
                name: "height",
                kind: ParamKind::Int,
                required: false,
                description: "Viewport height in pixels",
            },
            ParamSpec {
                name: "profile",
                kind: ParamKind::String,
                required: false,
                description: "Named profile to load into the context",
            },
        ],
    },
    ToolDef {
        name: "closeContext",
        description: "Close a browser context and release its resources",
        params: &[ParamSpec {
            name: "context_id",
            kind: ParamKind::String,
            required: true,
            description: "Context to close",
        }],
    },
    ToolDef {
        name: "listContexts",
        description: "List open browser contexts",
        params: &[],
    },
    ToolDef {
        name: "navigate",
        description: "Navigate a context to a URL and wait for load",
        params: &[
            CONTEXT_ID,
            ParamSpec {
                name: "url",
                kind: ParamKind::String,
                required: true,
                description: "Absolute URL to load",
            },
        ],
    },
    ToolDef {
        name: "click",
        description: "Click the first element matching a selector",
        params: &[CONTEXT_ID, SELECTOR],
    },
    ToolDef {
        name: "type",
        description: "Type text into the element matching a selector",
        params: &[
            CONTEXT_ID,
            SELECTOR,
            ParamSpec {
                name: "text",
                kind: ParamKind::String,
                required: true,
                description: "Text to type",
            },
        ],
    },
    ToolDef {
        name: "extractText",
        description: "Extract the text content of a matching element",
        params: &[CONTEXT_ID, SELECTOR],
    },
    ToolDef {
        name: "waitForSelector",
        description: "Wait until a selector matches or the timeout elapses",
        params: &[
            CONTEXT_ID,
            SELECTOR,
            ParamSpec {
                name: "timeout_ms",
                kind: ParamKind::Int,
                required: false,
                description: "Wait limit in milliseconds",
            },
        ],
    },
    ToolDef {
        name: "screenshot",
        description: "Capture the context viewport as an image",
        params: &[
            CONTEXT_ID,
            ParamSpec {
                name: "format",
                kind: ParamKind::Enum(&["jpeg", "png"]),
                required: false,
                description: "Image encoding",
            },
            ParamSpec {
                name: "quality",
                kind: ParamKind::Int,
                required: false,
                description: "JPEG quality 1-100",
            },
            ParamSpec {
                name: "full_page",
                kind: ParamKind::Bool,
                required: false,
                description: "Capture the whole document instead of the viewport",
            },
        ],
    },
    ToolDef {
        name: "startVideo",
        description: "Start the shared-memory video stream for a context",
        params: &[
            ParamSpec {
                name: "context_id",
                kind: ParamKind::String,
                required: true,
                description: "Context to stream",
            },
            ParamSpec {
                name: "fps",
                kind: ParamKind::Int,
                required: false,
                description: "Target frames per second",
            },
            ParamSpec {
                name: "quality",
                kind: ParamKind::Int,
                required: false,
                description: "JPEG quality 1-100",
            },
        ],
    },
    ToolDef {
        name: "stopVideo",
        description: "Stop the video stream for a context",
        params: &[ParamSpec {
            name: "context_id",
            kind: ParamKind::String,
            required: true,
            description: "Context to stop streaming",
        }],
    },
];

pub fn find(name: &str) -> Option<&'static ToolDef> {
    TOOLS.iter().find(|t| t.name == name)
}

/// Validate `params` against a tool's schema. Returns every field problem
/// at once. Unknown fields pass through untouched — the browser is the
/// authority on anything not declared here.
pub fn validate(tool: &ToolDef, params: &Value) -> Result<(), Vec<FieldError>> {
    let mut errors = Vec::new();

    let obj = match params {
        Value::Object(map) => map,
        Value::Null => {
            for p in tool.params.iter().filter(|p| p.required) {
                errors.push(FieldError::new(p.name, "required parameter is missing"));
            }
            return if errors.is_empty() { Ok(()) } else { Err(errors) };
        }
        _ => {
            return Err(vec![FieldError::new(
                "params",
                "parameters must be a JSON object",
            )])
        }
    };

    for spec in tool.params {
        let value = match obj.get(spec.name) {
            Some(v) => v,
            None => {
                if spec.required {
                    errors.push(FieldError::new(spec.name, "required parameter is missing"));
                }
                continue;
            }
        };
        match spec.kind {
            ParamKind::String => {
                if !value.is_string() {
                    errors.push(FieldError::new(spec.name, "expected a string"));
                }
            }
            ParamKind::Int => {
                if !value.is_i64() && !value.is_u64() {
                    errors.push(FieldError::new(spec.name, "expected an integer"));
                }
            }
            ParamKind::Bool => {
                if !value.is_boolean() {
                    errors.push(FieldError::new(spec.name, "expected a boolean"));
                }
            }
            ParamKind::Number => {
                if !value.is_number() {
                    errors.push(FieldError::new(spec.name, "expected a number"));
                }
            }
            ParamKind::Enum(options) => match value.as_str() {
                Some(s) if options.contains(&s) => {}
                _ => {
                    errors.push(FieldError::new(
                        spec.name,
                        format!("expected one of: {}", options.join(", ")),
                    ));
                }
            },
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn param_schema(spec: &ParamSpec) -> Value {
    let mut schema = json!({
        "name": spec.name,
        "type": spec.kind.type_name(),
        "required": spec.required,
        "description": spec.description,
    });
    if let ParamKind::Enum(options) = spec.kind {
        schema["enum"] = json!(options);
    }
    schema
}

/// Schema document served by `GET /tools`.
pub fn schema_json() -> Value {
    Value::Array(
        TOOLS
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "params": t.params.iter().map(param_schema).collect::<Vec<_>>(),
                })
            })
            .collect(),
    )
}

/// Schema for one tool, served by `GET /tools/{name}`.
pub fn tool_json(tool: &ToolDef) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "params": tool.params.iter().map(param_schema).collect::<Vec<_>>(),
    })
}
