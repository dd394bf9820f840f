use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;
use crate::providers::base::Usage;

/// One provider independent increment of a model response.
///
/// Every adapter produces a sequence of these ending in exactly one `Done` or
/// `Error`. Tool call fragments are correlated by `index`; a call is opened by
/// `ToolCallStart` and closed by `ToolCallEnd`, with any number of argument
/// fragments in between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    Text {
        text: String,
    },
    ToolCallStart {
        index: usize,
        id: String,
        name: String,
    },
    ToolCallArgs {
        index: usize,
        fragment: String,
    },
    ToolCallEnd {
        index: usize,
        /// Set when the stream ended before the call's arguments were complete
        truncated: bool,
    },
    Usage {
        usage: Usage,
    },
    Error {
        error: ProviderError,
    },
    Done {
        stop_reason: Option<String>,
    },
}

impl Delta {
    pub fn text<S: Into<String>>(text: S) -> Self {
        Delta::Text { text: text.into() }
    }

    pub fn done<S: Into<String>>(stop_reason: Option<S>) -> Self {
        Delta::Done {
            stop_reason: stop_reason.map(Into::into),
        }
    }

    pub fn error(error: ProviderError) -> Self {
        Delta::Error { error }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Delta::Done { .. } | Delta::Error { .. })
    }
}

pub type DeltaStream = BoxStream<'static, Delta>;
