use crate::error::{AppError, Result};
use std::io::Write;
use std::path::Path;
use tempfile::TempPath;

const SCRIPT_NAME: &str = "run-tasks";

/// The task/run-specific part of a generated script file name, e.g.
/// `run-tasks_job4_run163`. Maintenance matches this fragment against a
/// live process's command line before killing it.
pub fn script_name_fragment(task_id: i64, run_id: i64) -> String {
    format!("{SCRIPT_NAME}_job{task_id}_run{run_id}")
}

/// A run's command materialized as a temporary executable script. The file
/// is removed when this value is dropped, so it must outlive the child
/// process.
pub struct CommandScript {
    path: TempPath,
    fragment: String,
}

impl CommandScript {
    pub fn create(task_id: i64, run_id: i64, command: &str) -> Result<Self> {
        let fragment = script_name_fragment(task_id, run_id);
        let suffix = if cfg!(windows) { ".bat" } else { ".sh" };

        let mut file = tempfile::Builder::new()
            .prefix(&format!("{fragment}__"))
            .suffix(suffix)
            .tempfile()
            .map_err(|e| AppError::Process(format!("Failed to create script file: {e}")))?;

        // The explicit exit line propagates the last command's return code
        // through the shell wrapper.
        let body = if cfg!(windows) {
            format!("{command}\r\nexit /b %ERRORLEVEL%\r\n")
        } else {
            format!("{command}\nexit $?\n")
        };
        file.write_all(body.as_bytes())?;
        file.flush()?;

        Ok(Self {
            path: file.into_temp_path(),
            fragment,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fragment(&self) -> &str {
        &self.fragment
    }

    /// Platform shell invocation for the script.
    pub fn shell_command(&self) -> Vec<String> {
        let script = self.path.to_string_lossy().to_string();
        if cfg!(windows) {
            vec![
                "cmd".to_string(),
                "/c".to_string(),
                "call".to_string(),
                script,
            ]
        } else {
            vec!["/bin/bash".to_string(), "-xe".to_string(), script]
        }
    }
}
