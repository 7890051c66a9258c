use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const TYPE_SET_NAME: &str = "set_name";
pub const TYPE_REPLY: &str = "reply";

const KEY_TYPE: &str = "type";
const KEY_NAME: &str = "name";
const KEY_REPLY_ID: &str = "replyId";
const KEY_TARGET: &str = "target";
const KEY_STATUS: &str = "status";
const KEY_MESSAGE: &str = "message";

/// A JSON object exchanged with relay clients.
///
/// The relay only interprets a handful of control keys (`type`, `name`,
/// `replyId`, `target`); every other field is carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(Map<String, Value>);

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a JSON value, returning `None` unless it is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn set_name(name: &str) -> Self {
        let mut message = Self::new();
        message.insert(KEY_TYPE, TYPE_SET_NAME);
        message.insert(KEY_NAME, name);
        message
    }

    /// Builds the `{"status": .., "message": ..}` shape used for failed sends.
    pub fn error(status: &str, text: impl Into<String>) -> Self {
        let mut message = Self::new();
        message.insert(KEY_STATUS, status);
        message.insert(KEY_MESSAGE, text.into());
        message
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn kind(&self) -> Option<&str> {
        self.str_field(KEY_TYPE)
    }

    /// Display name carried by `set_name`. Numbers and booleans are taken
    /// as their text; `null` means no name.
    pub fn name(&self) -> Option<String> {
        self.text_field(KEY_NAME)
    }

    pub fn reply_id(&self) -> Option<&str> {
        self.str_field(KEY_REPLY_ID)
    }

    /// Raw `replyId` value, for callers that need to reject non-string ids.
    pub fn reply_id_value(&self) -> Option<&Value> {
        self.0.get(KEY_REPLY_ID)
    }

    pub fn set_reply_id(&mut self, reply_id: impl Into<String>) {
        self.insert(KEY_REPLY_ID, reply_id.into());
    }

    /// Routing hint, read the same way as [`Message::name`]. Only an absent,
    /// `null` or empty target counts as no target.
    pub fn target(&self) -> Option<String> {
        self.text_field(KEY_TARGET).filter(|target| !target.is_empty())
    }

    pub fn status(&self) -> Option<&str> {
        self.str_field(KEY_STATUS)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    fn text_field(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::Null => None,
            Value::String(text) => Some(text.clone()),
            other => Some(other.to_string()),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = serde_json::to_string(&self.0).map_err(|_| fmt::Error)?;
        f.write_str(&encoded)
    }
}

/// Case-insensitive name comparison used for `target` routing.
pub fn names_match(name: &str, target: &str) -> bool {
    name.chars()
        .flat_map(char::to_lowercase)
        .eq(target.chars().flat_map(char::to_lowercase))
}
