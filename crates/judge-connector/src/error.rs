use judge_protocol::{JudgeMessage, Status};
use thiserror::Error;

/// Cap on the compiler output forwarded to the dispatcher.
const MAX_COMPILER_TEXT: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum JudgeError {
    #[error("compile error")]
    Compile { stdout: String, stderr: String },

    #[error("test data format error: {message}")]
    Format { message: String, params: Vec<String> },

    #[error("{}", render_template(.message, .params))]
    System {
        message: String,
        params: Vec<String>,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("dispatch connection closed")]
    ChannelClosed,
}

impl JudgeError {
    pub fn system(message: impl Into<String>) -> Self {
        Self::System {
            message: message.into(),
            params: Vec::new(),
            source: None,
        }
    }

    /// A message template with `{0}`-style parameters, rendered by the dispatcher.
    pub fn system_with(message: impl Into<String>, params: Vec<String>) -> Self {
        Self::System {
            message: message.into(),
            params,
            source: None,
        }
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
            params: Vec::new(),
        }
    }

    /// Terminal status reported for this failure.
    pub fn verdict(&self) -> Status {
        match self {
            JudgeError::Compile { .. } => Status::CompileError,
            JudgeError::Format { .. } | JudgeError::System { .. } | JudgeError::ChannelClosed => {
                Status::SystemError
            }
        }
    }

    /// Structured message for the dispatcher. In `debug` mode a `stack`
    /// is attached: the source chain, or the error itself when it was
    /// raised directly.
    pub fn to_judge_message(&self, debug: bool) -> JudgeMessage {
        match self {
            JudgeError::Compile { stdout, stderr } => {
                JudgeMessage::Text(compiler_text(stdout, stderr))
            }
            JudgeError::Format { message, params } => JudgeMessage::Detail {
                message: message.clone(),
                params: params.clone(),
                stack: None,
            },
            JudgeError::System {
                message,
                params,
                source,
            } => JudgeMessage::Detail {
                message: message.clone(),
                params: params.clone(),
                stack: debug.then(|| match source {
                    Some(e) => format!("{e:?}"),
                    None => format!("{self:?}"),
                }),
            },
            JudgeError::ChannelClosed => JudgeMessage::Text(self.to_string()),
        }
    }
}

impl From<anyhow::Error> for JudgeError {
    fn from(err: anyhow::Error) -> Self {
        // Keep typed judge errors that were wrapped in anyhow along the way.
        match err.downcast::<JudgeError>() {
            Ok(judge) => judge,
            Err(err) => JudgeError::System {
                message: format!("{err:#}"),
                params: Vec::new(),
                source: Some(err),
            },
        }
    }
}

impl From<std::io::Error> for JudgeError {
    fn from(err: std::io::Error) -> Self {
        JudgeError::System {
            message: format!("i/o error: {err}"),
            params: Vec::new(),
            source: Some(err.into()),
        }
    }
}

/// Combined compiler diagnostics, stdout first.
pub fn compiler_text(stdout: &str, stderr: &str) -> String {
    let parts: Vec<&str> = [stdout.trim_end(), stderr.trim_end()]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect();
    let mut text = parts.join("\n");
    if text.len() > MAX_COMPILER_TEXT {
        let mut cut = MAX_COMPILER_TEXT;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n...");
    }
    text
}

fn render_template(message: &str, params: &[String]) -> String {
    params
        .iter()
        .enumerate()
        .fold(message.to_string(), |acc, (i, p)| {
            acc.replace(&format!("{{{i}}}"), p)
        })
}
