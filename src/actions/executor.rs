//! Action execution
//!
//! Directives are dispatched to an [`ActionExecutor`]. Built-in actions are
//! answered locally; anything else is handed to a script in the actions
//! directory, receiving the directive as JSON on stdin.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use super::date::format_date;
use super::directive::ActionDirective;
use crate::config::Settings;
use crate::error::ActionError;

/// Script extensions tried, in order, before a bare executable
const SCRIPT_EXTENSIONS: &[&str] = &["sh", "py", "js", "ts", "rb"];

/// Runs one directive and returns the text that replaces it
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Execute `directive`
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` when this executor does not know the action
    async fn execute(&self, directive: &ActionDirective) -> Result<String, ActionError>;
}

#[async_trait]
impl<F, Fut> ActionExecutor for F
where
    F: Fn(ActionDirective) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, ActionError>> + Send,
{
    async fn execute(&self, directive: &ActionDirective) -> Result<String, ActionError> {
        (self)(directive.clone()).await
    }
}

/// Typed view of a directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Current time of day
    Time,
    /// Current date
    Date,
    /// A reminder with an optional due time
    Reminder {
        title: String,
        at: Option<NaiveDateTime>,
    },
    /// Anything else, passed through untyped
    Other {
        name: String,
        params: BTreeMap<String, String>,
    },
}

impl Action {
    /// Validate a directive into a typed action
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` when a known action has missing or
    /// malformed parameters
    pub fn from_directive(directive: &ActionDirective) -> Result<Self, ActionError> {
        match directive.name.to_lowercase().as_str() {
            "time" => Ok(Self::Time),
            "date" | "today" => Ok(Self::Date),
            "reminder" | "remind" => {
                let title = directive
                    .param("title")
                    .or_else(|| directive.param("text"))
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| ActionError::InvalidParameter {
                        key: "title".to_string(),
                        reason: "missing".to_string(),
                    })?;

                if directive.param("date").is_some() && directive.date.is_none() {
                    return Err(ActionError::InvalidParameter {
                        key: "date".to_string(),
                        reason: "unrecognized date".to_string(),
                    });
                }

                Ok(Self::Reminder {
                    title: title.to_string(),
                    at: directive.date,
                })
            }
            _ => Ok(Self::Other {
                name: directive.name.clone(),
                params: directive.parameters.clone(),
            }),
        }
    }
}

/// Answers `time` and `date` from the local clock
#[derive(Debug, Clone, Copy)]
pub struct BuiltinExecutor {
    clock: fn() -> NaiveDateTime,
}

impl Default for BuiltinExecutor {
    fn default() -> Self {
        Self {
            clock: || chrono::Local::now().naive_local(),
        }
    }
}

impl BuiltinExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a fixed clock
    #[must_use]
    pub const fn with_clock(clock: fn() -> NaiveDateTime) -> Self {
        Self { clock }
    }
}

#[async_trait]
impl ActionExecutor for BuiltinExecutor {
    async fn execute(&self, directive: &ActionDirective) -> Result<String, ActionError> {
        let now = (self.clock)();
        match Action::from_directive(directive)? {
            Action::Time => Ok(now.format("%-I:%M %p").to_string()),
            Action::Date => Ok(now.format("%A, %B %-d").to_string()),
            Action::Reminder { .. } | Action::Other { .. } => {
                Err(ActionError::Unsupported(directive.name.clone()))
            }
        }
    }
}

/// JSON handed to an action script on stdin
#[derive(Debug, Serialize)]
struct ScriptInput<'a> {
    name: &'a str,
    parameters: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    date: Option<String>,
}

/// Runs `<actions_dir>/<name>.<ext>` with the directive as JSON on stdin
///
/// Trimmed stdout becomes the replacement text. The directory and timeout
/// are read from settings on every call.
#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    settings: Settings,
}

impl ScriptExecutor {
    #[must_use]
    pub const fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Locate the handler for `name`
    fn find_handler(dir: &Path, name: &str) -> Option<PathBuf> {
        SCRIPT_EXTENSIONS
            .iter()
            .map(|ext| dir.join(format!("{name}.{ext}")))
            .chain(std::iter::once(dir.join(name)))
            .find(|path| path.is_file())
    }
}

#[async_trait]
impl ActionExecutor for ScriptExecutor {
    async fn execute(&self, directive: &ActionDirective) -> Result<String, ActionError> {
        if !is_safe_name(&directive.name) {
            return Err(ActionError::InvalidParameter {
                key: "name".to_string(),
                reason: "must be alphanumeric, '-' or '_'".to_string(),
            });
        }

        let actions = self.settings.snapshot().actions;
        let Some(handler) = Self::find_handler(&actions.dir, &directive.name) else {
            return Err(ActionError::Unsupported(directive.name.clone()));
        };

        let input = ScriptInput {
            name: &directive.name,
            parameters: &directive.parameters,
            date: directive.date.map(format_date),
        };
        let input = serde_json::to_string(&input)
            .map_err(|e| ActionError::Failed(format!("failed to serialize directive: {e}")))?;

        run_script(&handler, &input, actions.timeout).await
    }
}

async fn run_script(handler: &Path, input: &str, limit: Duration) -> Result<String, ActionError> {
    let (program, args) = determine_executor(handler).map_err(ActionError::Failed)?;

    let mut child = Command::new(&program)
        .args(&args)
        .current_dir(handler.parent().unwrap_or_else(|| Path::new(".")))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ActionError::Failed(format!("failed to spawn handler: {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|e| ActionError::Failed(format!("failed to write to handler stdin: {e}")))?;
    }

    let output = timeout(limit, child.wait_with_output())
        .await
        .map_err(|_| ActionError::Failed(format!("handler timed out after {limit:?}")))?
        .map_err(|e| ActionError::Failed(format!("handler execution failed: {e}")))?;

    if !output.stderr.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::debug!(handler = %handler.display(), stderr = %stderr, "action stderr");
    }

    if !output.status.success() {
        let code = output.status.code().unwrap_or(-1);
        return Err(ActionError::Failed(format!("handler exited with code {code}")));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Determine how to execute the handler based on extension
fn determine_executor(handler: &Path) -> Result<(String, Vec<String>), String> {
    let extension = handler.extension().and_then(|e| e.to_str()).unwrap_or("");

    let path = handler
        .to_str()
        .ok_or("invalid handler path")?
        .to_string();

    match extension {
        "py" => Ok(("python3".to_string(), vec![path])),
        "js" => Ok(("node".to_string(), vec![path])),
        "ts" => Ok(("bun".to_string(), vec!["run".to_string(), path])),
        "rb" => Ok(("ruby".to_string(), vec![path])),
        "sh" => Ok(("bash".to_string(), vec![path])),
        // No extension, assume executable binary or script with shebang
        "" => Ok((path, vec![])),
        _ => Err(format!("unknown handler extension: .{extension}")),
    }
}

fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Tries executors in order until one supports the action
#[derive(Clone, Default)]
pub struct ChainExecutor {
    executors: Vec<Arc<dyn ActionExecutor>>,
}

impl std::fmt::Debug for ChainExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainExecutor")
            .field("executors", &self.executors.len())
            .finish()
    }
}

impl ChainExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an executor to the chain
    #[must_use]
    pub fn with(mut self, executor: impl ActionExecutor + 'static) -> Self {
        self.executors.push(Arc::new(executor));
        self
    }

    /// Built-in actions first, then scripts
    #[must_use]
    pub fn standard(settings: Settings) -> Self {
        Self::new()
            .with(BuiltinExecutor::new())
            .with(ScriptExecutor::new(settings))
    }
}

#[async_trait]
impl ActionExecutor for ChainExecutor {
    async fn execute(&self, directive: &ActionDirective) -> Result<String, ActionError> {
        for executor in &self.executors {
            match executor.execute(directive).await {
                Err(ActionError::Unsupported(_)) => {}
                other => return other,
            }
        }
        Err(ActionError::Unsupported(directive.name.clone()))
    }
}
