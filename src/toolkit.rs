//! File and process tools for coding-assistant style agents.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tokio::{fs, io::AsyncWriteExt};

use crate::error::{Result, TetherError};
use crate::tool::{Tool, ToolRegistry};

#[derive(Debug, Clone)]
pub struct ToolkitConfig {
    /// Relative paths resolve against this directory.
    pub root: PathBuf,
    pub command_timeout: Duration,
    pub max_output_chars: usize,
}

impl Default for ToolkitConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            command_timeout: Duration::from_secs(300),
            max_output_chars: 20_000,
        }
    }
}

impl ToolkitConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        }
    }
}

/// `read_file`, `write_file`, `list_directory` and `execute_command`.
pub fn coding_toolkit(config: ToolkitConfig) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool {
        config: config.clone(),
    });
    registry.register(WriteFileTool {
        config: config.clone(),
    });
    registry.register(ListDirectoryTool {
        config: config.clone(),
    });
    registry.register(ExecuteCommandTool { config });
    registry
}

fn required_str<'a>(input: &'a Value, field: &str, tool: &str) -> Result<&'a str> {
    input
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| TetherError::InvalidArguments {
            name: tool.into(),
            message: format!("missing `{field}`"),
        })
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}\n... (truncated)")
}

struct ReadFileTool {
    config: ToolkitConfig,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a UTF-8 file. Use it whenever the user asks to view, explain or analyse a file."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "filePath": {"type": "string", "description": "Path of the file to read"}
            },
            "required": ["filePath"]
        }))
    }

    async fn call(&self, input: Value) -> Result<Value> {
        let path = required_str(&input, "filePath", self.name())?;
        let contents = fs::read_to_string(self.config.resolve(path))
            .await
            .map_err(|err| TetherError::tool(self.name(), format!("cannot read `{path}`: {err}")))?;
        tracing::info!(path, bytes = contents.len(), "read file");
        Ok(json!({ "filePath": path, "content": contents }))
    }
}

struct WriteFileTool {
    config: ToolkitConfig,
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating parent directories and replacing any existing file."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "filePath": {"type": "string", "description": "Path of the file to write"},
                "content": {"type": "string", "description": "Full file content"}
            },
            "required": ["filePath", "content"]
        }))
    }

    async fn call(&self, input: Value) -> Result<Value> {
        let path = required_str(&input, "filePath", self.name())?;
        let contents = required_str(&input, "content", self.name())?;
        let target = self.config.resolve(path);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| TetherError::tool(self.name(), err))?;
        }
        let mut file = fs::File::create(&target)
            .await
            .map_err(|err| TetherError::tool(self.name(), format!("cannot create `{path}`: {err}")))?;
        file.write_all(contents.as_bytes())
            .await
            .map_err(|err| TetherError::tool(self.name(), err))?;

        tracing::info!(path, bytes = contents.len(), "wrote file");
        Ok(json!({ "filePath": path, "bytes_written": contents.len() }))
    }
}

struct ListDirectoryTool {
    config: ToolkitConfig,
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List the entries of a directory. Directories are suffixed with `/`."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "directoryPath": {"type": "string", "description": "Directory to list"}
            },
            "required": ["directoryPath"]
        }))
    }

    async fn call(&self, input: Value) -> Result<Value> {
        let path = required_str(&input, "directoryPath", self.name())?;
        let mut reader = fs::read_dir(self.config.resolve(path))
            .await
            .map_err(|err| TetherError::tool(self.name(), format!("cannot list `{path}`: {err}")))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|err| TetherError::tool(self.name(), err))?
        {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.map(|ft| ft.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            entries.push(name);
        }
        entries.sort();
        Ok(json!({ "directoryPath": path, "entries": entries }))
    }
}

struct ExecuteCommandTool {
    config: ToolkitConfig,
}

#[async_trait]
impl Tool for ExecuteCommandTool {
    fn name(&self) -> &str {
        "execute_command"
    }

    fn description(&self) -> &str {
        "Run a shell command. Use `workingDirectory` to change directory instead of `cd` in the command."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Shell command to execute"},
                "workingDirectory": {"type": "string", "description": "Directory to run in"}
            },
            "required": ["command"]
        }))
    }

    async fn call(&self, input: Value) -> Result<Value> {
        let command = required_str(&input, "command", self.name())?;
        let cwd = match input.get("workingDirectory").and_then(Value::as_str) {
            Some(dir) => self.config.resolve(dir),
            None => self.config.root.clone(),
        };

        #[cfg(unix)]
        let mut cmd = {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        };
        #[cfg(windows)]
        let mut cmd = {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        };
        cmd.current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(command, cwd = %cwd.display(), "executing command");
        let output = tokio::time::timeout(self.config.command_timeout, cmd.output())
            .await
            .map_err(|_| {
                TetherError::tool(
                    self.name(),
                    format!("command timed out after {:?}", self.config.command_timeout),
                )
            })?
            .map_err(|err| TetherError::tool(self.name(), err))?;

        let stdout = truncate(&String::from_utf8_lossy(&output.stdout), self.config.max_output_chars);
        let stderr = truncate(&String::from_utf8_lossy(&output.stderr), self.config.max_output_chars);

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".into());
            return Err(TetherError::tool(
                self.name(),
                format!("exit code {code}: {}", stderr.trim()),
            ));
        }

        Ok(json!({
            "stdout": stdout,
            "stderr": stderr,
            "exit_code": output.status.code().unwrap_or(0)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn writes_reads_and_lists_relative_to_root() {
        let dir = tempdir().unwrap();
        let tools = coding_toolkit(ToolkitConfig::new(dir.path()));

        tools
            .call(
                "write_file",
                json!({"filePath": "src/App.tsx", "content": "export default 1;"}),
            )
            .await
            .unwrap();
        let read = tools
            .call("read_file", json!({"filePath": "src/App.tsx"}))
            .await
            .unwrap();
        assert_eq!(read["content"], "export default 1;");

        let listed = tools
            .call("list_directory", json!({"directoryPath": "."}))
            .await
            .unwrap();
        assert_eq!(listed["entries"], json!(["src/"]));
    }

    #[tokio::test]
    async fn missing_file_is_a_tool_error() {
        let dir = tempdir().unwrap();
        let tools = coding_toolkit(ToolkitConfig::new(dir.path()));
        let err = tools
            .call("read_file", json!({"filePath": "nope.txt"}))
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::ToolExecution { .. }));
        assert!(err.to_string().contains("nope.txt"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_commands_in_working_directory() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("app")).unwrap();
        let tools = coding_toolkit(ToolkitConfig::new(dir.path()));

        let out = tools
            .call(
                "execute_command",
                json!({"command": "pwd && echo hello", "workingDirectory": "app"}),
            )
            .await
            .unwrap();
        let stdout = out["stdout"].as_str().unwrap();
        assert!(stdout.contains("app"));
        assert!(stdout.contains("hello"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_a_tool_error() {
        let dir = tempdir().unwrap();
        let tools = coding_toolkit(ToolkitConfig::new(dir.path()));
        let err = tools
            .call("execute_command", json!({"command": "echo oops >&2; exit 3"}))
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("exit code 3"));
        assert!(text.contains("oops"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn commands_are_time_boxed() {
        let dir = tempdir().unwrap();
        let tools = coding_toolkit(
            ToolkitConfig::new(dir.path()).with_command_timeout(Duration::from_millis(50)),
        );
        let err = tools
            .call("execute_command", json!({"command": "sleep 5"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn truncates_long_output() {
        assert_eq!(truncate("abc", 5), "abc");
        assert!(truncate("abcdef", 3).starts_with("abc\n..."));
    }
}
