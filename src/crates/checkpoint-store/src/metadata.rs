//! Checkpoint metadata documents
//!
//! Metadata is a small structured document (numbers, strings, booleans, nested
//! mappings). Its shape depends on the checkpoint's type tag, so it is modelled
//! twice:
//!
//! - [`Document`] - the open, ordered JSON object that is persisted as-is
//! - [`TypedMetadata`] - a tagged view for the producers this store knows about,
//!   with an [`TypedMetadata::Open`] fallback for everything else
//!
//! Decoding never fails: unknown tags, extra fields and documents written by older
//! producers all land somewhere readable.
//!
//! ```rust
//! use checkpoint_store::{Document, TypedMetadata};
//! use serde_json::json;
//!
//! let doc = Document::new().with("selected_output", json!("/work/brain_norm.nii.gz"));
//! match TypedMetadata::decode("preprocess", &doc) {
//!     TypedMetadata::Preprocess { selected_output, .. } => {
//!         assert_eq!(selected_output, "/work/brain_norm.nii.gz");
//!     }
//!     other => panic!("unexpected {other:?}"),
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Ordered string-keyed JSON object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.insert(key, value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Non-object values are wrapped under a `value` key
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            Value::Null => Self::default(),
            other => Self::default().with("value", other),
        }
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Type tag of image conversion checkpoints
pub const KIND_IMAGE_CONVERSION: &str = "image_conversion";
/// Type tag of preprocessing checkpoints
pub const KIND_PREPROCESS: &str = "preprocess";
/// Type tag of segmentation checkpoints
pub const KIND_SEGMENTATION: &str = "segmentation";
/// Type tag of rendering checkpoints
pub const KIND_RENDER: &str = "render";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImageConversionFields {
    source: String,
    output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PreprocessFields {
    selected_output: String,
    #[serde(default)]
    candidates: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SegmentationFields {
    #[serde(default)]
    artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RenderFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cover: Option<String>,
    #[serde(default)]
    artifacts: Vec<String>,
}

/// Metadata viewed through its type tag
///
/// Only identifiers and paths live here; payload bytes go to the blob store.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedMetadata {
    /// Scan converted into a volume file
    ImageConversion { source: String, output: String },
    /// Preprocessing step and the output it selected
    Preprocess {
        selected_output: String,
        candidates: Vec<String>,
    },
    /// Segmentation outputs
    Segmentation {
        artifacts: Vec<String>,
        tool: Option<String>,
    },
    /// Rendering outputs
    Render {
        cover: Option<String>,
        artifacts: Vec<String>,
    },
    /// Any other tag, or a known tag with an unexpected shape
    Open { kind: String, document: Document },
}

impl TypedMetadata {
    /// Interpret `document` according to `kind`
    pub fn decode(kind: &str, document: &Document) -> Self {
        let value = document.clone().into_value();
        let typed = match kind {
            KIND_IMAGE_CONVERSION => serde_json::from_value::<ImageConversionFields>(value)
                .ok()
                .map(|f| Self::ImageConversion {
                    source: f.source,
                    output: f.output,
                }),
            KIND_PREPROCESS => serde_json::from_value::<PreprocessFields>(value)
                .ok()
                .map(|f| Self::Preprocess {
                    selected_output: f.selected_output,
                    candidates: f.candidates,
                }),
            KIND_SEGMENTATION => serde_json::from_value::<SegmentationFields>(value)
                .ok()
                .map(|f| Self::Segmentation {
                    artifacts: f.artifacts,
                    tool: f.tool,
                }),
            KIND_RENDER => serde_json::from_value::<RenderFields>(value)
                .ok()
                .map(|f| Self::Render {
                    cover: f.cover,
                    artifacts: f.artifacts,
                }),
            _ => None,
        };

        typed.unwrap_or_else(|| Self::Open {
            kind: kind.to_string(),
            document: document.clone(),
        })
    }

    /// Type tag and document to persist
    pub fn encode(&self) -> (String, Document) {
        let fields = match self {
            Self::ImageConversion { source, output } => serde_json::to_value(ImageConversionFields {
                source: source.clone(),
                output: output.clone(),
            }),
            Self::Preprocess {
                selected_output,
                candidates,
            } => serde_json::to_value(PreprocessFields {
                selected_output: selected_output.clone(),
                candidates: candidates.clone(),
            }),
            Self::Segmentation { artifacts, tool } => serde_json::to_value(SegmentationFields {
                artifacts: artifacts.clone(),
                tool: tool.clone(),
            }),
            Self::Render { cover, artifacts } => serde_json::to_value(RenderFields {
                cover: cover.clone(),
                artifacts: artifacts.clone(),
            }),
            Self::Open { kind, document } => return (kind.clone(), document.clone()),
        };

        // plain structs of strings always serialize
        let document = fields.map(Document::from_value).unwrap_or_default();
        (self.kind().to_string(), document)
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::ImageConversion { .. } => KIND_IMAGE_CONVERSION,
            Self::Preprocess { .. } => KIND_PREPROCESS,
            Self::Segmentation { .. } => KIND_SEGMENTATION,
            Self::Render { .. } => KIND_RENDER,
            Self::Open { kind, .. } => kind,
        }
    }
}
