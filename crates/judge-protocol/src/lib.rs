use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a judging record on the dispatcher.
pub type RecordId = String;

/// Language id -> toolchain descriptor, as pushed by the dispatcher.
pub type LanguageTable = BTreeMap<String, LanguageSpec>;

/// Frames received from the dispatcher. Both keys may be present at once.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ServerFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<LanguageTable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<WorkItem>,
}

/// Toolchain descriptor for one language. Unknown fields are kept as-is
/// so they can be handed to the execution engine untouched.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct LanguageSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_file: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One judging request delivered by the dispatcher.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkItem {
    pub rid: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<serde_json::Value>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub judge_type: Option<String>,
    #[serde(rename = "pdomain")]
    pub domain_id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub pid: String,
    pub lang: String,
    #[serde(default)]
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default)]
    pub data: Vec<DataFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    /// Judged against the problem's test data.
    Submission,
    /// Ad-hoc run against an explicit input.
    Run,
}

impl WorkItem {
    pub fn kind(&self) -> WorkKind {
        if self.input.is_some() {
            WorkKind::Run
        } else {
            WorkKind::Submission
        }
    }
}

/// Descriptor of one remote test-data file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DataFile {
    pub name: String,
    #[serde(default)]
    pub etag: String,
    #[serde(
        default,
        rename = "lastModified",
        deserialize_with = "string_or_number"
    )]
    pub last_modified: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl DataFile {
    /// Version tag recorded in the on-disk manifest: content tag followed
    /// by the modification timestamp.
    pub fn version_tag(&self) -> String {
        format!("{}{}", self.etag, self.last_modified)
    }
}

/// Frames sent to the dispatcher, tagged by `key`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "key", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping,
    Prio { prio: i32 },
    Status { info: serde_json::Value },
    Next(NextPayload),
    End(EndPayload),
}

/// Progress update for a record.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct NextPayload {
    pub rid: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    #[serde(
        default,
        rename = "compilerText",
        skip_serializing_if = "Option::is_none"
    )]
    pub compiler_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<JudgeMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case: Option<CaseReport>,
}

impl NextPayload {
    pub fn new(rid: impl Into<RecordId>) -> Self {
        Self {
            rid: rid.into(),
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<JudgeMessage>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_compiler_text(mut self, text: impl Into<String>) -> Self {
        self.compiler_text = Some(text.into());
        self
    }

    pub fn with_case(mut self, case: CaseReport) -> Self {
        self.case = Some(case);
        self
    }
}

/// Terminal verdict for a record. Sent exactly once.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EndPayload {
    pub rid: RecordId,
    pub status: Status,
    pub score: u32,
    pub time: u64,
    pub memory: u64,
}

/// Result of a single test case.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CaseReport {
    pub status: Status,
    #[serde(default)]
    pub time: u64,
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub message: String,
}

/// Human-readable judge text: plain, or a template with parameters.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum JudgeMessage {
    Text(String),
    Detail {
        message: String,
        #[serde(default)]
        params: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
}

impl From<&str> for JudgeMessage {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for JudgeMessage {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Record status codes understood by the dispatcher.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(into = "u8", try_from = "u8")]
pub enum Status {
    Waiting,
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    RuntimeError,
    CompileError,
    SystemError,
    Canceled,
    Etc,
    Hacked,
    Judging,
    Compiling,
    Fetched,
    Ignored,
}

impl Status {
    pub fn code(self) -> u8 {
        match self {
            Status::Waiting => 0,
            Status::Accepted => 1,
            Status::WrongAnswer => 2,
            Status::TimeLimitExceeded => 3,
            Status::MemoryLimitExceeded => 4,
            Status::OutputLimitExceeded => 5,
            Status::RuntimeError => 6,
            Status::CompileError => 7,
            Status::SystemError => 8,
            Status::Canceled => 9,
            Status::Etc => 10,
            Status::Hacked => 11,
            Status::Judging => 20,
            Status::Compiling => 21,
            Status::Fetched => 22,
            Status::Ignored => 30,
        }
    }
}

impl From<Status> for u8 {
    fn from(status: Status) -> Self {
        status.code()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownStatus(pub u8);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown status code {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl TryFrom<u8> for Status {
    type Error = UnknownStatus;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => Status::Waiting,
            1 => Status::Accepted,
            2 => Status::WrongAnswer,
            3 => Status::TimeLimitExceeded,
            4 => Status::MemoryLimitExceeded,
            5 => Status::OutputLimitExceeded,
            6 => Status::RuntimeError,
            7 => Status::CompileError,
            8 => Status::SystemError,
            9 => Status::Canceled,
            10 => Status::Etc,
            11 => Status::Hacked,
            20 => Status::Judging,
            21 => Status::Compiling,
            22 => Status::Fetched,
            30 => Status::Ignored,
            other => return Err(UnknownStatus(other)),
        })
    }
}

/// Accepts `"123"`, `123` or `null` and yields the textual form.
fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}
