use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::platform::dispatch::Dispatcher;
use crate::platform::InboundEvent;
use crate::store::users::UserRecord;

/// Everything a step's logic gets to look at for one event.
pub struct StepContext<'a> {
    pub event: &'a InboundEvent,
    pub user: &'a UserRecord,
    /// Name of the step that was active when the event arrived. Stays fixed
    /// across delegation hops.
    pub prev_step: &'a str,
    /// Outbound side channel for steps that push photos or files themselves.
    pub dispatcher: &'a Dispatcher,
}

/// Result of a step's `advance`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Keep the step that computed this transition.
    Stay,
    /// Move to the named step and render its prompt.
    Goto(String),
    /// Hand the transition decision to the named step without rendering
    /// anything for the current one. The delegate may itself delegate.
    Delegate(String),
}

/// An option offered under a step's prompt, rendered as a keyboard button.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionItem {
    /// The label is also the selection key.
    Label(String),
    Keyed {
        key: String,
        label: String,
        /// Platform styling hint carried through to the button.
        intent: Option<String>,
    },
}

impl OptionItem {
    pub fn key(&self) -> &str {
        match self {
            OptionItem::Label(label) => label,
            OptionItem::Keyed { key, .. } => key,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            OptionItem::Label(label) => label,
            OptionItem::Keyed { label, .. } => label,
        }
    }

    pub fn intent(&self) -> Option<&str> {
        match self {
            OptionItem::Label(_) => None,
            OptionItem::Keyed { intent, .. } => intent.as_deref(),
        }
    }
}

/// One named node of the dialog state machine.
///
/// `render` produces the step's prompt (`None`/empty means the step is silent),
/// `advance` decides where the event moves the user, and `options` lists the
/// buttons offered under the prompt. Steps exposing both a command and a
/// description are advertised in each platform's native command list.
#[async_trait]
pub trait Step: Send + Sync {
    /// Command that jumps straight to this step, overriding stored state.
    fn command(&self) -> Option<&str> {
        None
    }

    /// Human-readable description shown in platform command lists.
    fn description(&self) -> Option<&str> {
        None
    }

    async fn render(&self, cx: &StepContext<'_>) -> Result<Option<String>>;

    async fn advance(&self, _cx: &StepContext<'_>) -> Result<Transition> {
        Ok(Transition::Stay)
    }

    async fn options(&self, _cx: &StepContext<'_>) -> Result<Vec<OptionItem>> {
        Ok(Vec::new())
    }
}

/// Immutable step table supplied by the caller. Names are the machine's
/// states.
pub type StepTable = HashMap<String, Arc<dyn Step>>;
